//! Public routing surface of the tunnel server.
//!
//! Every inbound connection lands in the [`RequestDispatcher`]: requests for
//! a registered subdomain are injected onto a borrowed tunnel socket
//! ([`inject`]) or bridged raw for upgrades ([`bridge`]); everything else
//! falls through to the management app. Heads are parsed off the wire by
//! hand ([`head`]) because the upgrade path must keep the peer socket raw:
//! the 101 response comes from the tunnel client, not from this server.

pub mod bridge;
pub mod dispatch;
pub mod head;
pub mod inject;
pub mod rewind;
pub mod server;

pub use dispatch::RequestDispatcher;
pub use head::{BodyFraming, HeadError, RequestHead, ResponseHead, MAX_HEAD_SIZE};
pub use server::TunnelServer;
