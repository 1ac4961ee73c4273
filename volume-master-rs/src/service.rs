//! Coordinator thread.
//!
//! The [`MergeEngine`] lives on a dedicated thread. Callers talk to it through
//! an [`EngineHandle`]; OS callbacks reach it through the engine's event
//! queue. Window polling and key tap retries run off tickers on the same
//! thread, so all merge state is mutated from one place.

use crate::audio::device::AudioDevice;
use crate::audio::property::ObjectId;
use crate::input::keys::MediaKey;
use crate::merge::{DisplaySink, MergeEngine, MergeError, MergeRequest, MergeStatus};
use crate::window::POLL_INTERVAL;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Interval between key tap installation attempts while permission is missing.
pub const TAP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Requests handled by the coordinator.
pub enum EngineCommand {
    CreateMerge {
        request: MergeRequest,
        reply: Sender<Result<ObjectId, MergeError>>,
    },
    DestroyMerge {
        reply: Sender<()>,
    },
    RevertDefaultOutput {
        reply: Sender<bool>,
    },
    CleanupOrphans {
        reply: Sender<usize>,
    },
    ToggleSpatial {
        enabled: bool,
        reply: Sender<bool>,
    },
    Status {
        reply: Sender<MergeStatus>,
    },
    OutputDevices {
        reply: Sender<Vec<AudioDevice>>,
    },
    SetDisplaySink {
        sink: Option<DisplaySink>,
    },
    SetUnmergeOnDisconnect {
        enabled: bool,
    },
    /// Inject a volume key as if it came from the key tap
    MediaKey {
        key: MediaKey,
    },
    /// Revert, unmerge and stop the thread
    Shutdown {
        reply: Sender<()>,
    },
}

/// Handle to a running coordinator.
pub struct EngineHandle {
    commands: Sender<EngineCommand>,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

struct Coordinator {
    engine: MergeEngine,
    commands: Receiver<EngineCommand>,
}

impl EngineHandle {
    /// Move the engine onto its own thread and start the device monitor.
    pub fn spawn(mut engine: MergeEngine) -> std::io::Result<Self> {
        let (commands_tx, commands_rx) = unbounded();
        let active = engine.active_flag();

        if let Err(e) = engine.start_device_monitor() {
            tracing::warn!(error = %e, "device monitor unavailable");
        }

        let coordinator = Coordinator {
            engine,
            commands: commands_rx,
        };
        let thread = thread::Builder::new()
            .name("merge-coordinator".into())
            .spawn(move || coordinator.run())?;

        Ok(Self {
            commands: commands_tx,
            active,
            thread: Some(thread),
        })
    }

    /// Lock-free read of the merge state.
    pub fn is_merge_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn create_merge(&self, request: MergeRequest) -> Result<ObjectId, MergeError> {
        self.call(|reply| EngineCommand::CreateMerge { request, reply })?
    }

    pub fn destroy_merge(&self) -> Result<(), MergeError> {
        self.call(|reply| EngineCommand::DestroyMerge { reply })
    }

    pub fn revert_default_output(&self) -> Result<bool, MergeError> {
        self.call(|reply| EngineCommand::RevertDefaultOutput { reply })
    }

    pub fn cleanup_orphans(&self) -> Result<usize, MergeError> {
        self.call(|reply| EngineCommand::CleanupOrphans { reply })
    }

    pub fn toggle_spatial(&self, enabled: bool) -> Result<bool, MergeError> {
        self.call(|reply| EngineCommand::ToggleSpatial { enabled, reply })
    }

    pub fn status(&self) -> Result<MergeStatus, MergeError> {
        self.call(|reply| EngineCommand::Status { reply })
    }

    /// Physical output endpoints, own virtual endpoints excluded.
    pub fn output_devices(&self) -> Result<Vec<AudioDevice>, MergeError> {
        self.call(|reply| EngineCommand::OutputDevices { reply })
    }

    pub fn set_display_sink(&self, sink: Option<DisplaySink>) -> Result<(), MergeError> {
        self.send(EngineCommand::SetDisplaySink { sink })
    }

    pub fn set_unmerge_on_disconnect(&self, enabled: bool) -> Result<(), MergeError> {
        self.send(EngineCommand::SetUnmergeOnDisconnect { enabled })
    }

    pub fn press_key(&self, key: MediaKey) -> Result<(), MergeError> {
        self.send(EngineCommand::MediaKey { key })
    }

    /// Revert the default output, destroy the merge and join the thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.call(|reply| EngineCommand::Shutdown { reply });
        if thread.join().is_err() {
            tracing::error!("merge coordinator panicked");
        }
    }

    fn send(&self, command: EngineCommand) -> Result<(), MergeError> {
        self.commands
            .send(command)
            .map_err(|_| MergeError::ServiceUnavailable)
    }

    fn call<T>(&self, command: impl FnOnce(Sender<T>) -> EngineCommand) -> Result<T, MergeError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(command(reply_tx))?;
        reply_rx.recv().map_err(|_| MergeError::ServiceUnavailable)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Coordinator {
    fn run(mut self) {
        info!("merge coordinator started");
        let events = self.engine.event_receiver();
        let window_ticks = tick(POLL_INTERVAL);
        let retry_ticks = tick(TAP_RETRY_INTERVAL);

        loop {
            select! {
                recv(self.commands) -> command => match command {
                    Ok(EngineCommand::Shutdown { reply }) => {
                        self.engine.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        debug!("command channel closed");
                        self.engine.shutdown();
                        break;
                    }
                },
                recv(events) -> event => {
                    if let Ok(event) = event {
                        self.engine.handle_event(event);
                    }
                }
                recv(window_ticks) -> _ => self.engine.on_window_tick(),
                recv(retry_ticks) -> _ => self.engine.on_retry_tick(),
            }
        }
        info!("merge coordinator stopped");
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::CreateMerge { request, reply } => {
                let _ = reply.send(self.engine.create_merge(&request));
            }
            EngineCommand::DestroyMerge { reply } => {
                self.engine.destroy_merge();
                let _ = reply.send(());
            }
            EngineCommand::RevertDefaultOutput { reply } => {
                let _ = reply.send(self.engine.revert_default_output());
            }
            EngineCommand::CleanupOrphans { reply } => {
                let _ = reply.send(self.engine.cleanup_orphans());
            }
            EngineCommand::ToggleSpatial { enabled, reply } => {
                let _ = reply.send(self.engine.toggle_spatial(enabled));
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(self.engine.status());
            }
            EngineCommand::OutputDevices { reply } => {
                let _ = reply.send(self.engine.directory().output_devices());
            }
            EngineCommand::SetDisplaySink { sink } => self.engine.set_display_sink(sink),
            EngineCommand::SetUnmergeOnDisconnect { enabled } => {
                self.engine.set_unmerge_on_disconnect(enabled)
            }
            EngineCommand::MediaKey { key } => self.engine.handle_media_key(key),
            EngineCommand::Shutdown { .. } => {}
        }
    }
}
