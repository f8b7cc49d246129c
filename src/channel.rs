//! Channel bindings as the circuit sees them.
//!
//! A binding pairs the client-side identifier with the server-side
//! identity learned from the name-search reply. Ownership is shared
//! with the upper-layer channel registry; the circuit only tracks
//! membership and the fields its staging operations need.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::proto::FieldType;

#[derive(Debug)]
struct ChannelIo {
    sid: u32,
    field_type: FieldType,
    native_count: u32,
    connected: bool,
}

/// One named data point bound to a circuit.
#[derive(Debug)]
pub struct ChannelBinding {
    cid: u32,
    name: String,
    io: Mutex<ChannelIo>,
}

impl ChannelBinding {
    pub fn new(cid: u32, name: impl Into<String>) -> Self {
        Self {
            cid,
            name: name.into(),
            io: Mutex::new(ChannelIo {
                sid: 0,
                field_type: FieldType::String,
                native_count: 0,
                connected: false,
            }),
        }
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sid(&self) -> u32 {
        self.lock().sid
    }

    pub fn field_type(&self) -> FieldType {
        self.lock().field_type
    }

    pub fn native_count(&self) -> u32 {
        self.lock().native_count
    }

    /// Has the server confirmed the claim for this channel?
    pub fn connected(&self) -> bool {
        self.lock().connected
    }

    /// Record the identity learned from the search reply.
    pub fn search_reply_set_up(&self, sid: u32, field_type: FieldType, native_count: u32) {
        let mut io = self.lock();
        io.sid = sid;
        io.field_type = field_type;
        io.native_count = native_count;
    }

    /// Flipped by the upper layer when the claim reply arrives (and
    /// back when the circuit goes away).
    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    fn lock(&self) -> MutexGuard<'_, ChannelIo> {
        self.io.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── ChannelList ──────────────────────────────────────────────────

/// Membership list of channels currently riding one circuit.
#[derive(Debug, Default)]
pub(crate) struct ChannelList {
    by_cid: HashMap<u32, Arc<ChannelBinding>>,
}

impl ChannelList {
    pub fn add(&mut self, chan: Arc<ChannelBinding>) {
        self.by_cid.insert(chan.cid(), chan);
    }

    pub fn remove(&mut self, cid: u32) -> Option<Arc<ChannelBinding>> {
        self.by_cid.remove(&cid)
    }

    pub fn len(&self) -> usize {
        self.by_cid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cid.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Arc<ChannelBinding>> {
        self.by_cid.drain().map(|(_, chan)| chan).collect()
    }
}
