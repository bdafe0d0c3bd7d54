//! Host-side traffic boundary.
//!
//! The hosting proxy pushes intercepted records into the session with
//! [`crate::Session::deliver_traffic`] and receives possibly-modified
//! records back through a [`TrafficSink`]. No assumption is made about the
//! host SDK's own event API shape.

use async_trait::async_trait;

use crate::bridge::protocol::TrafficRecord;

/// Conventional capability name the script exposes for intercepted traffic.
pub const PROCESS_TRAFFIC: &str = "processTraffic";

/// Accepts records flowing back from the script side.
#[async_trait]
pub trait TrafficSink: Send + Sync {
    async fn accept(&self, record: TrafficRecord);
}
