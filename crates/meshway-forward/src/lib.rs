//! meshway-forward — the forwarding plane.
//!
//! Carries end-user HTTP requests across the overlay:
//!
//! ```text
//! client ──HTTP──▶ AccessProxy ──▶ BufferManager ──▶ PeerTransport
//!                                                       │ framed batch
//!                              RelayProxy ◀─────────────┘
//!                                │  (mid-path: hop++ and forward)
//!                                ▼  (last hop: terminal HTTP call)
//!                              origin
//! ```
//!
//! Responses travel the hop list in reverse; each relay decrements the hop
//! counter and forwards, and the access proxy matches response packets to
//! waiting callers by request ID. Requests towards the same next hop are
//! coalesced into one framed batch within a short merge window; the inverse
//! split happens on the return path.

pub mod access;
pub mod buffer;
pub mod error;
pub mod http;
pub mod relay;
pub mod state;
pub mod transport;

pub use access::{AccessConfig, AccessProxy, DomainResolver};
pub use buffer::{BatchEntry, BufferConfig, BufferManager, ResponseEntry, SendOps};
pub use error::{ForwardError, ForwardResult};
pub use relay::{RelayConfig, RelayProxy};
pub use state::{Direction, RequestStateManager, RequestStatus};
pub use transport::{run_frame_listener, InboundFrame, PeerTransport};
