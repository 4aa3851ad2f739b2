use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::Serialize;

use super::{Confirmation, HumanPrompt, PromptAnswer};
use crate::error::SortError;
use crate::{validate_class_name, BinColor, Timestamp};

/// Cancellation is observed at least this often while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    /// Which bin does the class go in?
    Bin,
    /// Is the detected class correct?
    Confirm,
}

/// A question waiting for an operator, as listed to front-ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingPrompt {
    pub id: String,
    pub kind: PromptKind,
    pub class_name: String,
    pub created: Timestamp,
}

enum Reply {
    Bin(Option<BinColor>),
    Confirm(Confirmation),
}

struct Waiting {
    prompt: PendingPrompt,
    reply: mpsc::Sender<Reply>,
}

struct BrokerInner {
    pending: Mutex<BTreeMap<String, Waiting>>,
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
}

/// Queue of operator questions answered out-of-band (e.g. over the API).
///
/// Asking registers a `PendingPrompt` and blocks on a channel until `answer`
/// is called, the timeout elapses, or the cancel flag is raised. Timeouts and
/// cancellation count as "skip".
#[derive(Clone)]
pub struct PromptBroker {
    inner: Arc<BrokerInner>,
}

impl PromptBroker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self::with_cancel_flag(timeout, Arc::new(AtomicBool::new(false)))
    }

    /// Share a cancel flag (typically the session shutdown flag).
    pub fn with_cancel_flag(timeout: Option<Duration>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                pending: Mutex::new(BTreeMap::new()),
                timeout,
                cancel,
            }),
        }
    }

    /// Wake every waiter with a skip and refuse new waits.
    pub fn cancel_all(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    /// Questions currently waiting, oldest first.
    pub fn pending(&self) -> Vec<PendingPrompt> {
        let Ok(pending) = self.inner.pending.lock() else {
            return Vec::new();
        };
        let mut out: Vec<PendingPrompt> = pending.values().map(|w| w.prompt.clone()).collect();
        out.sort_by_key(|p| p.created);
        out
    }

    /// Deliver an answer. Invalid answers leave the question pending.
    pub fn answer(&self, id: &str, answer: PromptAnswer) -> Result<(), SortError> {
        let mut pending = self
            .inner
            .pending
            .lock()
            .map_err(|_| SortError::InvalidUserInput("prompt queue unavailable".to_string()))?;
        let kind = pending
            .get(id)
            .map(|w| w.prompt.kind)
            .ok_or_else(|| SortError::InvalidUserInput(format!("no pending prompt '{}'", id)))?;
        let reply = validate(kind, answer)?;
        if let Some(waiting) = pending.remove(id) {
            if waiting.reply.send(reply).is_err() {
                log::warn!("PromptBroker: prompt {} was abandoned before its answer", id);
            }
        }
        Ok(())
    }

    fn ask(&self, kind: PromptKind, class_name: &str) -> Option<Reply> {
        if self.inner.cancel.load(Ordering::SeqCst) {
            return None;
        }
        let id = new_prompt_id();
        let (tx, rx) = mpsc::channel();
        {
            let Ok(mut pending) = self.inner.pending.lock() else {
                log::error!("PromptBroker: prompt queue lock poisoned");
                return None;
            };
            pending.insert(
                id.clone(),
                Waiting {
                    prompt: PendingPrompt {
                        id: id.clone(),
                        kind,
                        class_name: class_name.to_string(),
                        created: Timestamp::now().unwrap_or_default(),
                    },
                    reply: tx,
                },
            );
        }
        log::info!("PromptBroker: waiting on prompt {} ({:?} '{}')", id, kind, class_name);

        let reply = self.wait(&id, rx);
        if let Ok(mut pending) = self.inner.pending.lock() {
            pending.remove(&id);
        }
        reply
    }

    fn wait(&self, id: &str, rx: mpsc::Receiver<Reply>) -> Option<Reply> {
        let deadline = self.inner.timeout.map(|t| Instant::now() + t);
        loop {
            if self.inner.cancel.load(Ordering::SeqCst) {
                log::info!("PromptBroker: prompt {} cancelled", id);
                return None;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        log::info!("PromptBroker: prompt {} timed out", id);
                        return None;
                    }
                    remaining.min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            match rx.recv_timeout(slice) {
                Ok(reply) => return Some(reply),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn validate(kind: PromptKind, answer: PromptAnswer) -> Result<Reply, SortError> {
    match (kind, answer) {
        (PromptKind::Bin, PromptAnswer::Bin { bin_color }) => {
            Ok(Reply::Bin(Some(bin_color.parse::<BinColor>()?)))
        }
        (PromptKind::Bin, PromptAnswer::Skip) => Ok(Reply::Bin(None)),
        (PromptKind::Confirm, PromptAnswer::Accept) => Ok(Reply::Confirm(Confirmation::Accept)),
        (PromptKind::Confirm, PromptAnswer::Correct { class_name }) => {
            validate_class_name(&class_name)?;
            Ok(Reply::Confirm(Confirmation::Correct(class_name)))
        }
        (PromptKind::Confirm, PromptAnswer::Skip) => Ok(Reply::Confirm(Confirmation::Skip)),
        (kind, answer) => Err(SortError::InvalidUserInput(format!(
            "answer {:?} does not fit a {:?} prompt",
            answer, kind
        ))),
    }
}

fn new_prompt_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl HumanPrompt for PromptBroker {
    fn ask_bin(&self, class_name: &str) -> Result<Option<BinColor>, SortError> {
        match self.ask(PromptKind::Bin, class_name) {
            Some(Reply::Bin(bin)) => Ok(bin),
            _ => Ok(None),
        }
    }

    fn confirm_detection(&self, class_name: &str) -> Result<Confirmation, SortError> {
        match self.ask(PromptKind::Confirm, class_name) {
            Some(Reply::Confirm(confirmation)) => Ok(confirmation),
            _ => Ok(Confirmation::Skip),
        }
    }
}
