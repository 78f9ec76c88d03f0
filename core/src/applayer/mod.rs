//! Minimal application-layer state.
//!
//! Fed from reassembled stream messages; provides the buffers behind the
//! http/tls rule predicates and the flat HTTP log.

pub mod http;
pub mod tls;

use crate::flow::FlowState;
use crate::stream::{StreamMsg, STREAM_GAP};

/// Advances a flow's application-layer state with one stream message.
pub fn update_flow(state: &mut FlowState, msg: &StreamMsg) {
    if msg.flags & STREAM_GAP != 0 || msg.data.is_empty() {
        return;
    }
    if msg.dir().is_to_server() {
        state
            .http
            .get_or_insert_with(http::HttpState::new)
            .feed(&msg.data);
    }
    state
        .tls
        .get_or_insert_with(tls::TlsState::new)
        .feed(&msg.data);
}
