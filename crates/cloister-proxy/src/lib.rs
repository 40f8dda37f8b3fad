//! Connection plumbing shared by both supervisors: the bidirectional stream
//! pump, the accept-loop stream forwarder, the egress policy evaluator, and
//! the HTTP forward proxy.

pub mod forward;
pub mod http;
pub mod policy;
pub mod pump;

pub use forward::{run_forwarder, BoxedStream, Dialer, Duplex, Listener, TcpDialer, TransportDialer};
pub use http::{
    empty_body, forward_request, full_body, request_authority, serve_connections, status_response,
    strip_hop_by_hop, DirectDialer, ForwardError, HttpProxy, ProxyBody, UpstreamDialer,
};
pub use policy::{EgressPolicy, PolicyError, Verdict};
pub use pump::{pump, PumpSummary};
