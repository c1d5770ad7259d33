use metrics::{describe_counter, describe_gauge, describe_histogram};

pub const GATEWAY_CONN_TOTAL: &str = "gateway_connections_total";
pub const GATEWAY_CURR_CONN: &str = "gateway_curr_connections";
pub const GATEWAY_ROUTE_ERR_TOTAL: &str = "gateway_route_errors_total";
pub const GATEWAY_HANDSHAKE_LATENCY: &str = "gateway_handshake_latency";

pub fn describe_gateway_metrics() {
    describe_counter!(
        GATEWAY_CONN_TOTAL,
        "Accepted client connections, labeled by frontend protocol."
    );
    describe_gauge!(
        GATEWAY_CURR_CONN,
        "Client connections currently open, labeled by frontend protocol."
    );
    describe_counter!(
        GATEWAY_ROUTE_ERR_TOTAL,
        "Connections rejected because no upstream route matched."
    );
    describe_histogram!(
        GATEWAY_HANDSHAKE_LATENCY,
        "Milliseconds from accept until the session enters the splice phase."
    );
}
