//! Frame loop for one detection session.
//!
//! The loop is single-threaded: per iteration it drains operator commands,
//! pulls one frame and runs it through the `SortOrchestrator`. Other threads
//! (API connections, the Ctrl-C handler) talk to it only through the command
//! channel and the shutdown flag.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::SortError;
use crate::ingest::FrameSource;
use crate::orchestrator::SortOrchestrator;
use crate::Timestamp;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Manual operator actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorCommand {
    ForceSort,
    Reset,
    CorrectLast,
    Quit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    EndOfStream,
    FrameLimit,
    Shutdown,
    /// The source failed; the message is the capture error.
    CaptureFailed(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub sorted: u64,
    pub end: SessionEnd,
}

/// Owns the frame source and (through the orchestrator) the actuator.
/// Dropping the session releases both.
pub struct Session {
    source: Box<dyn FrameSource>,
    orchestrator: SortOrchestrator,
    commands: Receiver<OperatorCommand>,
    shutdown: Arc<AtomicBool>,
    frame_limit: Option<u64>,
}

impl Session {
    pub fn new(
        source: Box<dyn FrameSource>,
        orchestrator: SortOrchestrator,
        commands: Receiver<OperatorCommand>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            orchestrator,
            commands,
            shutdown,
            frame_limit: None,
        }
    }

    /// Stop after `limit` frames.
    pub fn with_frame_limit(mut self, limit: Option<u64>) -> Self {
        self.frame_limit = limit;
        self
    }

    pub fn orchestrator(&self) -> &SortOrchestrator {
        &self.orchestrator
    }

    pub fn run(&mut self) -> Result<SessionSummary> {
        self.source.connect()?;
        let mut frames = 0u64;
        let mut sorted = 0u64;
        let mut last_health_log = Instant::now();
        let mut last_progress = None;

        let end = loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break SessionEnd::Shutdown;
            }
            if self.frame_limit.is_some_and(|limit| frames >= limit) {
                break SessionEnd::FrameLimit;
            }
            if self.drain_commands(&mut sorted)? {
                break SessionEnd::Shutdown;
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break SessionEnd::EndOfStream,
                Err(err) => {
                    let err = SortError::Capture(format!("{:#}", err));
                    log::error!("Session: {}", err);
                    break SessionEnd::CaptureFailed(err.to_string());
                }
            };
            frames += 1;

            match self.orchestrator.process_frame(&frame, frame.captured_at) {
                Ok(Some(_)) => sorted += 1,
                Ok(None) => {}
                Err(err) => log::error!("Session: frame {} failed: {:#}", frames, err),
            }

            let progress = self.orchestrator.trigger().progress();
            if progress != last_progress {
                if let Some(progress) = &progress {
                    log::debug!("Session: tracking {}", progress);
                }
                last_progress = progress;
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                let stats = self.source.stats();
                log::info!(
                    "Session: source health={} frames={} source={} sorted={}",
                    self.source.is_healthy(),
                    stats.frames_captured,
                    stats.source,
                    sorted
                );
                last_health_log = Instant::now();
            }
        };

        log::info!(
            "Session: ended ({:?}) after {} frames, {} sorted",
            end,
            frames,
            sorted
        );
        Ok(SessionSummary { frames, sorted, end })
    }

    /// Apply queued commands. Returns true when the operator asked to quit.
    fn drain_commands(&mut self, sorted: &mut u64) -> Result<bool> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(false),
            };
            log::info!("Session: operator command {:?}", command);
            match command {
                OperatorCommand::Quit => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Ok(true);
                }
                OperatorCommand::Reset => self.orchestrator.reset(),
                OperatorCommand::ForceSort => {
                    if self.orchestrator.force_sort(Timestamp::now()?)?.is_some() {
                        *sorted += 1;
                    }
                }
                OperatorCommand::CorrectLast => {
                    self.orchestrator.correct_last()?;
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.source.release();
        log::info!("Session: released frame source and actuator");
    }
}

/// Run a session to completion and release its resources.
pub fn run_session(mut session: Session) -> Result<SessionSummary> {
    session.run()
}
