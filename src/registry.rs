/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Process-wide registry of restartable servers.
//!
//! The registry maps each listening address to its server and records a
//! stable ordering of addresses. That ordering is what parent and child agree
//! on during an upgrade: position `i` in the order means "the listener for
//! this address is inherited at descriptor `3 + i`". In a parent the order is
//! registration order; in a restart child it is decoded from the
//! `ENDLESS_SOCKET_ORDER` environment variable, so both sides agree even when
//! map iteration order differs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

use crate::error::Error;
use crate::server::ServerShared;

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

pub(crate) fn read() -> RwLockReadGuard<'static, Registry> {
    REGISTRY.read().expect("server registry lock poisoned")
}

pub(crate) fn write() -> RwLockWriteGuard<'static, Registry> {
    REGISTRY.write().expect("server registry lock poisoned")
}

#[derive(Default)]
pub(crate) struct Registry {
    servers: HashMap<String, Arc<ServerShared>>,
    order: Vec<String>,
    socket_offset: HashMap<String, usize>,
    forked: bool,
}

impl Registry {
    /// Records a server under its address and assigns its descriptor slot.
    ///
    /// `socket_order` is the raw `ENDLESS_SOCKET_ORDER` value; when non-empty
    /// the slot assignment is positional from that list. Re-registering an
    /// address keeps its existing slot.
    pub(crate) fn register(&mut self, addr: String, server: Arc<ServerShared>, socket_order: &str) {
        if !socket_order.is_empty() {
            for (offset, inherited) in decode_socket_order(socket_order) {
                self.socket_offset.insert(inherited, offset);
            }
        } else if !self.socket_offset.contains_key(&addr) {
            self.socket_offset.insert(addr.clone(), self.order.len());
        }
        if !self.servers.contains_key(&addr) {
            self.order.push(addr.clone());
        }
        self.servers.insert(addr, server);
    }

    /// Descriptor-slot offset for an address, if one was assigned.
    pub(crate) fn offset(&self, addr: &str) -> Option<usize> {
        self.socket_offset.get(addr).copied()
    }

    pub(crate) fn servers(&self) -> impl Iterator<Item = (&String, &Arc<ServerShared>)> {
        self.servers.iter()
    }

    pub(crate) fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Claims the process's single upgrade slot.
    ///
    /// Only the first caller may spawn a replacement; everyone after gets
    /// [`Error::AlreadyForked`]. The flag never resets, which is what stops a
    /// storm of HUPs from producing a cascade of children.
    pub(crate) fn claim_fork_slot(&mut self) -> Result<(), Error> {
        if self.forked {
            return Err(Error::AlreadyForked);
        }
        self.forked = true;
        Ok(())
    }
}

/// Decodes `ENDLESS_SOCKET_ORDER` into (offset, address) pairs.
pub(crate) fn decode_socket_order(raw: &str) -> impl Iterator<Item = (usize, String)> + '_ {
    raw.split(',').map(str::to_string).enumerate()
}

/// Encodes the slot-ordered address list for a child's environment.
pub(crate) fn encode_socket_order(addrs: &[String]) -> String {
    addrs.join(",")
}
