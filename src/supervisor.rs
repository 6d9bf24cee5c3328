//! Child process supervision.
//!
//! The PPP session runs as a supervised child that is respawned whenever it
//! exits while auto-restart is enabled, regardless of who stopped it.  Anyone
//! who wants it to stay down must disable auto-restart first.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{NetdError, Result};

/// An observed child exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildExit {
    pub child:     String,
    /// Exit status, `None` when terminated by a signal.
    pub code:      Option<i32>,
    /// Whether a stop or kill was issued before the exit.
    pub requested: bool,
}

pub trait ProcessSupervisor: Send {
    /// Enable or disable automatic respawn of `child`.  Idempotent.
    fn set_autorestart(&mut self, child: &str, enabled: bool) -> Result<()>;
    fn autorestart(&self, child: &str) -> bool;
    fn start(&mut self, child: &str) -> Result<()>;
    /// Ask the child to terminate (SIGTERM).
    fn stop(&mut self, child: &str) -> Result<()>;
    /// Terminate the child unconditionally (SIGKILL).
    fn kill(&mut self, child: &str) -> Result<()>;
    /// Running as of the last [`ProcessSupervisor::poll`].
    fn is_running(&self, child: &str) -> bool;
    /// Reap exited children and respawn those with auto-restart enabled.
    fn poll(&mut self, now: Instant) -> Vec<ChildExit>;
}

struct Supervised {
    program:        String,
    args:           Vec<String>,
    child:          Option<Child>,
    autorestart:    bool,
    respawn_at:     Option<Instant>,
    stop_requested: bool,
}

/// In-process supervisor for locally spawned children.
pub struct LocalSupervisor {
    children:      HashMap<String, Supervised>,
    respawn_delay: Duration,
}

impl LocalSupervisor {
    pub fn new(respawn_delay: Duration) -> Self {
        Self { children: HashMap::new(), respawn_delay }
    }

    /// Register `name` with a whitespace-separated command line.  Auto-restart
    /// starts enabled.
    pub fn register(&mut self, name: &str, command_line: &str) -> Result<()> {
        let mut parts = command_line.split_whitespace().map(String::from);
        let program = parts
            .next()
            .ok_or_else(|| NetdError::Supervisor(format!("{name}: empty command")))?;
        self.children.insert(name.to_string(), Supervised {
            program,
            args: parts.collect(),
            child: None,
            autorestart: true,
            respawn_at: None,
            stop_requested: false,
        });
        Ok(())
    }

    fn entry(&mut self, child: &str) -> Result<&mut Supervised> {
        self.children
            .get_mut(child)
            .ok_or_else(|| NetdError::Supervisor(format!("unknown child {child}")))
    }

    fn signal(&mut self, child: &str, sig: Signal) -> Result<()> {
        let s = self.entry(child)?;
        s.stop_requested = true;
        if let Some(c) = &s.child {
            let pid = Pid::from_raw(c.id() as i32);
            match signal::kill(pid, sig) {
                Ok(()) => debug!("supervisor: {sig:?} sent to {child} ({pid})"),
                // Already gone; the exit is picked up by poll().
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => return Err(NetdError::Nix(e)),
            }
        }
        Ok(())
    }
}

fn spawn(name: &str, s: &mut Supervised) -> Result<()> {
    let child = Command::new(&s.program)
        .args(&s.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| NetdError::Supervisor(format!("spawn {name}: {e}")))?;
    info!("supervisor: started {name} (pid {})", child.id());
    s.child = Some(child);
    s.stop_requested = false;
    s.respawn_at = None;
    Ok(())
}

impl ProcessSupervisor for LocalSupervisor {
    fn set_autorestart(&mut self, child: &str, enabled: bool) -> Result<()> {
        let s = self.entry(child)?;
        if s.autorestart != enabled {
            info!("supervisor: auto-restart of {child} {}", if enabled { "enabled" } else { "disabled" });
            s.autorestart = enabled;
        }
        if !enabled {
            s.respawn_at = None;
        }
        Ok(())
    }

    fn autorestart(&self, child: &str) -> bool {
        self.children.get(child).is_some_and(|s| s.autorestart)
    }

    fn start(&mut self, child: &str) -> Result<()> {
        let s = self.entry(child)?;
        if s.child.is_some() {
            return Ok(());
        }
        spawn(child, s)
    }

    fn stop(&mut self, child: &str) -> Result<()> {
        self.signal(child, Signal::SIGTERM)
    }

    fn kill(&mut self, child: &str) -> Result<()> {
        self.signal(child, Signal::SIGKILL)
    }

    fn is_running(&self, child: &str) -> bool {
        self.children.get(child).is_some_and(|s| s.child.is_some())
    }

    fn poll(&mut self, now: Instant) -> Vec<ChildExit> {
        let mut exits = Vec::new();
        for (name, s) in self.children.iter_mut() {
            if let Some(c) = s.child.as_mut() {
                match c.try_wait() {
                    Ok(Some(status)) => {
                        let exit = ChildExit {
                            child:     name.clone(),
                            code:      status.code(),
                            requested: s.stop_requested,
                        };
                        info!("supervisor: {name} exited ({status})");
                        s.child = None;
                        s.stop_requested = false;
                        if s.autorestart {
                            s.respawn_at = Some(now + self.respawn_delay);
                        }
                        exits.push(exit);
                    }
                    Ok(None) => {}
                    Err(e) => warn!("supervisor: wait on {name} failed: {e}"),
                }
            }

            if let Some(at) = s.respawn_at {
                if !s.autorestart {
                    s.respawn_at = None;
                } else if now >= at && s.child.is_none() {
                    if let Err(e) = spawn(name, s) {
                        warn!("{e}; retrying");
                        s.respawn_at = Some(now + self.respawn_delay);
                    }
                }
            }
        }
        exits
    }
}

impl Drop for LocalSupervisor {
    fn drop(&mut self) {
        for (name, s) in self.children.iter_mut() {
            if let Some(mut c) = s.child.take() {
                debug!("supervisor: reaping {name} on shutdown");
                let _ = c.kill();
                let _ = c.wait();
            }
        }
    }
}
