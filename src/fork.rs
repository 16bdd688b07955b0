/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Replacement-process coordination.
//!
//! On SIGHUP the parent spawns the same executable with the same argument
//! vector, passing every registered listening socket as an inherited file
//! descriptor. Descriptors are remapped so the child finds them at 3, 4, …
//! in slot order, and the environment tells the child it is a restart
//! continuation (`ENDLESS_CONTINUE`) and which address owns which slot
//! (`ENDLESS_SOCKET_ORDER`, only written when more than one server is
//! registered). The parent and child both accept on the sockets for a short
//! window, which is what keeps connection attempts from being refused during
//! the handoff.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::getppid;

use crate::error::Error;
use crate::registry;

/// Environment variable marking a process as a restart continuation.
pub const ENV_CONTINUE: &str = "ENDLESS_CONTINUE";

/// Environment variable carrying the slot-ordered listening addresses.
pub const ENV_SOCKET_ORDER: &str = "ENDLESS_SOCKET_ORDER";

/// Descriptor number a child uses for the listener in the given slot.
/// Slots start right after stdin, stdout, and stderr.
pub(crate) fn inherited_fd(offset: usize) -> RawFd {
    3 + offset as RawFd
}

/// Spawns the replacement process, handing over every registered listener.
///
/// At most one fork succeeds per parent lifetime; later calls fail with
/// [`Error::AlreadyForked`]. A spawn failure is fatal: the upgrade slot is
/// already spent, so the parent cannot honor a retry.
pub(crate) fn fork() -> Result<(), Error> {
    let mut registry = registry::write();
    registry.claim_fork_slot()?;

    let count = registry.server_count();
    let mut slots: Vec<(usize, String, OwnedFd)> = Vec::with_capacity(count);
    for (addr, server) in registry.servers() {
        let slot = registry.offset(addr).unwrap_or(0);
        let fd = server.listener_file(inherited_fd(count))?;
        slots.push((slot, addr.clone(), fd));
    }
    slots.sort_by_key(|(slot, _, _)| *slot);
    for (index, (slot, addr, _)) in slots.iter().enumerate() {
        if *slot != index {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("descriptor slots are not contiguous (address {addr} claims slot {slot})"),
            )));
        }
    }

    let mut args = std::env::args_os();
    let program = args.next().ok_or_else(|| {
        Error::Io(io::Error::new(io::ErrorKind::NotFound, "argv is empty, cannot re-exec"))
    })?;

    let mut cmd = Command::new(&program);
    cmd.args(args);
    cmd.env(ENV_CONTINUE, "1");
    if count > 1 {
        let order: Vec<String> = slots.iter().map(|(_, addr, _)| addr.clone()).collect();
        cmd.env(ENV_SOCKET_ORDER, registry::encode_socket_order(&order));
    }

    // The duplicates were numbered at or above 3 + count, so moving them
    // down into 3..3+count cannot clobber a not-yet-moved source.
    let raw_fds: Vec<RawFd> = slots.iter().map(|(_, _, fd)| fd.as_raw_fd()).collect();
    unsafe {
        cmd.pre_exec(move || {
            for (slot, &fd) in raw_fds.iter().enumerate() {
                let target = inherited_fd(slot);
                if libc::dup2(fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(fd);
            }
            Ok(())
        });
    }

    match cmd.spawn() {
        Ok(child) => {
            tracing::info!(
                pid = std::process::id(),
                child_pid = child.id(),
                listeners = count,
                "spawned replacement process"
            );
            Ok(())
        }
        Err(err) => {
            // The upgrade slot is spent and the handoff contract can only be
            // honored once, so a failed launch ends the parent.
            tracing::error!(error = %err, "failed to launch replacement process, aborting");
            std::process::exit(1);
        }
    }
}

/// Tells the parent to begin draining once this restart child is listening.
///
/// The parent may be busy, so the signal is repeated a few times at a short
/// interval. If the parent is already gone this process has been reparented
/// to PID 1, which must not be signaled.
pub(crate) async fn notify_parent() {
    let pid = std::process::id();
    for _ in 0..3 {
        let ppid = getppid();
        if ppid.as_raw() == 1 {
            tracing::info!(pid, "parent already exited, skipping handoff signal");
            break;
        }
        match kill(ppid, Signal::SIGTERM) {
            Ok(()) => tracing::info!(pid, ppid = ppid.as_raw(), "sent SIGTERM to parent"),
            Err(err) => {
                tracing::warn!(pid, ppid = ppid.as_raw(), error = %err, "failed to signal parent");
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inherited_descriptors_start_after_stdio() {
        assert_eq!(inherited_fd(0), 3);
        assert_eq!(inherited_fd(1), 4);
        assert_eq!(inherited_fd(5), 8);
    }
}
