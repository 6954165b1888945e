//! Turn debouncer: collapse bursts of partial transcripts into one
//! finalized utterance per pause in speech.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Why a fragment was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    Empty,
    Speaking,
}

/// Restartable quiet-period timer over the latest transcript fragment.
///
/// Each accepted fragment bumps a generation and re-arms the timer; when it
/// fires, the generation is posted on `elapsed`. Only a post matching the
/// current generation finalizes, so a cancelled timer that raced its abort
/// is harmless.
pub struct TurnDebouncer {
    quiet: Duration,
    elapsed: mpsc::UnboundedSender<u64>,
    pending: Option<String>,
    last_order: Option<u64>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl TurnDebouncer {
    pub fn new(quiet: Duration, elapsed: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            quiet,
            elapsed,
            pending: None,
            last_order: None,
            generation: 0,
            timer: None,
        }
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Offer a fragment. Empty fragments and anything arriving while the
    /// session speaks are discarded.
    pub fn on_fragment(&mut self, text: &str, order: u64, speaking: bool) -> Result<(), Discard> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Discard::Empty);
        }
        if speaking {
            trace!(order, "Discarding fragment while speaking");
            return Err(Discard::Speaking);
        }

        self.pending = Some(text.to_string());
        self.last_order = Some(order);
        self.generation += 1;
        self.rearm();
        Ok(())
    }

    fn rearm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let generation = self.generation;
        let quiet = self.quiet;
        let elapsed = self.elapsed.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let _ = elapsed.send(generation);
        }));
    }

    /// Timer fired: yield the latest fragment if `generation` is current.
    pub fn on_elapsed(&mut self, generation: u64) -> Option<String> {
        if generation != self.generation {
            trace!(generation, current = self.generation, "Stale debounce timer");
            return None;
        }
        self.timer = None;
        let utterance = self.pending.take()?;
        debug!(order = ?self.last_order, chars = utterance.len(), "Turn finalized");
        Some(utterance)
    }

    /// Drop pending text and stop the timer. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.pending = None;
        self.generation += 1;
    }
}

impl Drop for TurnDebouncer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_millis(1200);

    async fn next_finalized(
        debouncer: &mut TurnDebouncer,
        elapsed: &mut mpsc::UnboundedReceiver<u64>,
    ) -> Option<String> {
        let generation = elapsed.recv().await?;
        debouncer.on_elapsed(generation)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_yields_one_utterance_with_last_fragment() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = TurnDebouncer::new(QUIET, tx);

        for (i, text) in ["I", "I think", "I think Rust", "I think Rust is great"].iter().enumerate() {
            debouncer.on_fragment(text, 1, false).unwrap();
            if i < 3 {
                tokio::time::sleep(Duration::from_millis(400)).await;
            }
        }

        let finalized = next_finalized(&mut debouncer, &mut rx).await;
        assert_eq!(finalized.as_deref(), Some("I think Rust is great"));
        assert!(debouncer.pending().is_none());

        // Nothing else fires afterwards
        tokio::time::sleep(QUIET * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_restarts_on_each_fragment() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = TurnDebouncer::new(QUIET, tx);

        debouncer.on_fragment("one", 1, false).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        debouncer.on_fragment("one two", 1, false).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(rx.try_recv().is_err(), "quiet period restarted");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let generation = rx.recv().await.unwrap();
        assert_eq!(debouncer.on_elapsed(generation).as_deref(), Some("one two"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discards_empty_and_speaking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = TurnDebouncer::new(QUIET, tx);

        assert_eq!(debouncer.on_fragment("   ", 1, false), Err(Discard::Empty));
        assert_eq!(debouncer.on_fragment("echo", 2, true), Err(Discard::Speaking));
        assert!(debouncer.pending().is_none());

        tokio::time::sleep(QUIET * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_stale_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = TurnDebouncer::new(QUIET, tx);

        debouncer.on_fragment("hello", 1, false).unwrap();
        debouncer.cancel();
        debouncer.cancel();
        tokio::time::sleep(QUIET * 2).await;
        assert!(rx.try_recv().is_err());

        // A generation from before the cancel never finalizes
        assert_eq!(debouncer.on_elapsed(1), None);
    }
}
