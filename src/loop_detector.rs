//! Repeated-substring screening for generated text.
//!
//! The scan is shortest-first: a candidate pattern of length L is the
//! length-L prefix of the content, and the first L whose occurrence count
//! reaches the repetition threshold wins. Short stutters stay cheap to
//! detect while longer repeated blocks are still caught. Cost is O(L·N)
//! per tested length; detection runs once per message or once per
//! accumulation threshold, not per byte.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::models::{LoopDetectionConfig, LoopDetectionResult};

const TOOL_CALL_HISTORY_CAP: usize = 64;

/// Scans accumulated text for repeated substrings. Shared across
/// concurrently executing requests; thresholds can be hot-swapped via
/// [`configure`](LoopDetector::configure).
#[derive(Debug)]
pub struct LoopDetector {
    config: Mutex<LoopDetectionConfig>,
    /// Signatures of recent tool invocations, newest last. Tracked
    /// independently of raw-text repetition.
    tool_calls: Mutex<VecDeque<String>>,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopDetectionConfig::default())
    }
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig) -> Self {
        Self {
            config: Mutex::new(config),
            tool_calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Replace thresholds without resetting tool-call history.
    pub fn configure(
        &self,
        min_pattern_length: usize,
        max_pattern_length: usize,
        min_repetitions: usize,
    ) {
        let mut cfg = self.config.lock().unwrap_or_else(|e| e.into_inner());
        cfg.min_pattern_length = min_pattern_length.max(1);
        cfg.max_pattern_length = max_pattern_length.max(cfg.min_pattern_length);
        cfg.min_repetitions = min_repetitions.max(2);
    }

    pub fn config(&self) -> LoopDetectionConfig {
        *self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Scan `content` for a repeated prefix pattern.
    pub fn check_for_loops(&self, content: &str) -> LoopDetectionResult {
        let cfg = self.config();
        if !cfg.enabled {
            return LoopDetectionResult::clean();
        }

        // Two repetitions of the minimum pattern cannot be observed below
        // this length.
        if content.len() < 2 * cfg.min_pattern_length {
            return LoopDetectionResult::clean();
        }

        let bytes = content.as_bytes();
        let max_len = cfg.max_pattern_length.min(content.len() / 2);

        for pattern_len in cfg.min_pattern_length..=max_len {
            let pattern = &bytes[..pattern_len];
            let count = count_occurrences(bytes, pattern);
            if count >= cfg.min_repetitions {
                let pattern_str = String::from_utf8_lossy(pattern).into_owned();
                return LoopDetectionResult {
                    has_loop: true,
                    pattern: Some(pattern_str.clone()),
                    repetitions: count,
                    details: Some(format!(
                        "pattern of length {pattern_len} repeated {count} times"
                    )),
                };
            }
        }

        LoopDetectionResult::clean()
    }

    /// Record one tool invocation signature and check whether the same
    /// signature has been issued `min_repetitions` times in a row.
    pub fn register_tool_call(&self, signature: impl Into<String>) -> LoopDetectionResult {
        let signature = signature.into();
        let cfg = self.config();

        let mut calls = self.tool_calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.push_back(signature.clone());
        while calls.len() > TOOL_CALL_HISTORY_CAP {
            calls.pop_front();
        }

        if !cfg.enabled {
            return LoopDetectionResult::clean();
        }

        let run = calls
            .iter()
            .rev()
            .take_while(|s| **s == signature)
            .count();
        if run >= cfg.min_repetitions {
            return LoopDetectionResult {
                has_loop: true,
                pattern: Some(signature),
                repetitions: run,
                details: Some("identical tool call repeated".into()),
            };
        }

        LoopDetectionResult::clean()
    }

    /// Forget tracked tool invocations.
    pub fn clear_history(&self) {
        self.tool_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Count (overlapping) occurrences of `pattern` in `haystack`.
fn count_occurrences(haystack: &[u8], pattern: &[u8]) -> usize {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return 0;
    }
    haystack
        .windows(pattern.len())
        .filter(|w| *w == pattern)
        .count()
}
