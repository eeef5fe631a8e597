// ut-test-utils: shared helpers for integration-testing utran peers.
//
// `MockServer` is a scriptable raw-stream server for exercising the client's
// liveness and reconnect behavior; `RawProbe` is a bare protocol client for
// poking a real server below the facade level.

pub mod mock_server;
pub mod probe;

pub use mock_server::{MockServer, MockServerOptions};
pub use probe::{ProbeEvent, RawProbe};
