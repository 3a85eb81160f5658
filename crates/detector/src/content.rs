//! Streamed-content repetition analysis.
//!
//! Maintains a bounded history of recently streamed text and looks for
//! "chanting": the same short span recurring in tight succession. Markdown
//! structure (fences, tables, lists, headings, blockquotes) produces
//! legitimately repetitive syntax, so structural chunks reset tracking and
//! fenced code is skipped outright.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use turnstile_config::DetectorConfig;

/// Minimum run length of one repeated character that flags degeneration.
const CHAR_RUN_THRESHOLD: usize = 16;

/// How far back into history the char-run fast path looks, beyond the chunk.
const CHAR_RUN_LOOKBEHIND: usize = 300;

/// Chunk length above which the quote/asterisk density fast path applies.
const DENSITY_MIN_LEN: usize = 100;

/// Multiplier on the window size for the clustering test: the four most
/// recent occurrences of a chunk must sit within this average gap.
const MAX_AVG_GAP_FACTOR: f64 = 2.0;

/// Characters whose long runs are ordinary markdown (dividers, emphasis,
/// fences) rather than degeneration.
const MARKDOWN_RUN_CHARS: &[char] = &['*', '-', '_', '=', '#', '`', '~', '|', '>', '+'];

/// Quote characters counted by the density fast path.
const QUOTE_CHARS: &[char] = &['"', '\'', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

/// Markdown structure at a line start: table rows, list items, headings,
/// blockquotes. Fences are counted separately for parity tracking.
static STRUCTURAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(\|.*\||[-*+] |\d+\. |#{1,6} |> ?)").expect("valid structural regex")
});

/// Degenerate quote emission: a run of quote marks separated only by
/// whitespace.
static BROKEN_QUOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("([\"\u{201c}\u{201d}]\\s*){8,}").expect("valid broken-quote regex")
});

/// Tracks streamed content and detects chanting.
///
/// Positions are char indices into `history`; every index stored in `stats`
/// is valid for the current buffer (truncation shifts them in lockstep).
pub(crate) struct ContentTracker {
    chunk_size: usize,
    loop_threshold: usize,
    max_history: usize,
    quote_density_threshold: f64,
    asterisk_density_threshold: f64,

    history: Vec<char>,
    stats: HashMap<u64, Vec<usize>>,
    next_scan_index: usize,
    in_code_block: bool,
}

impl ContentTracker {
    pub(crate) fn new(config: &DetectorConfig) -> Self {
        Self {
            chunk_size: config.content_chunk_size,
            loop_threshold: config.content_loop_threshold,
            max_history: config.max_history_length,
            quote_density_threshold: config.quote_density_threshold,
            asterisk_density_threshold: config.asterisk_density_threshold,
            history: Vec::new(),
            stats: HashMap::new(),
            next_scan_index: 0,
            in_code_block: false,
        }
    }

    /// Feed one streamed chunk. Returns `true` when chanting is detected.
    pub(crate) fn record(&mut self, text: &str) -> bool {
        let fences = text.matches("```").count();

        if fences > 0 || STRUCTURAL_RE.is_match(text) {
            self.reset_tracking();
        }

        let was_in_code_block = self.in_code_block;
        if fences % 2 == 1 {
            self.in_code_block = !self.in_code_block;
        }
        if was_in_code_block || self.in_code_block {
            return false;
        }

        let chunk_len = text.chars().count();
        self.history.extend(text.chars());

        let tripped = self.fast_path_tripped(text, chunk_len);
        self.truncate_history();
        if tripped {
            return true;
        }
        self.analyze_chunks()
    }

    /// Clear repetition tracking without touching code-fence parity.
    /// Called on structural markers and on every tool call.
    pub(crate) fn reset_tracking(&mut self) {
        self.history.clear();
        self.stats.clear();
        self.next_scan_index = 0;
    }

    /// Full reset for a new prompt.
    pub(crate) fn reset(&mut self) {
        self.reset_tracking();
        self.in_code_block = false;
    }

    pub(crate) fn history_len(&self) -> usize {
        self.history.len()
    }

    pub(crate) fn tracked_chunks(&self) -> usize {
        self.stats.len()
    }

    // ── Fast paths ──────────────────────────────────────────────────────

    /// Cheap degenerate-output signatures checked before chunk analysis.
    fn fast_path_tripped(&self, text: &str, chunk_len: usize) -> bool {
        // (a) one character repeated many times in a row, over the chunk
        // plus a bounded tail of history
        let window_len = chunk_len + CHAR_RUN_LOOKBEHIND;
        let start = self.history.len().saturating_sub(window_len);
        if has_long_char_run(&self.history[start..]) {
            return true;
        }

        // (b) runs of quote marks separated only by whitespace
        if BROKEN_QUOTE_RE.is_match(text) {
            return true;
        }

        // (c) heavy simultaneous quote and asterisk density on long chunks
        if chunk_len > DENSITY_MIN_LEN {
            let quotes = text.chars().filter(|c| QUOTE_CHARS.contains(c)).count();
            let asterisks = text.chars().filter(|&c| c == '*').count();
            let len = chunk_len as f64;
            if quotes as f64 / len > self.quote_density_threshold
                && asterisks as f64 / len > self.asterisk_density_threshold
            {
                return true;
            }
        }

        false
    }

    // ── History maintenance ─────────────────────────────────────────────

    /// Evict from the front down to the cap, shifting stored chunk positions
    /// and discarding any that fall off the buffer.
    fn truncate_history(&mut self) {
        if self.history.len() <= self.max_history {
            return;
        }
        let excess = self.history.len() - self.max_history;
        self.history.drain(..excess);
        self.next_scan_index = self.next_scan_index.saturating_sub(excess);

        for positions in self.stats.values_mut() {
            positions.retain_mut(|pos| {
                if *pos >= excess {
                    *pos -= excess;
                    true
                } else {
                    false
                }
            });
        }
        self.stats.retain(|_, positions| !positions.is_empty());
    }

    // ── Sliding-window analysis ─────────────────────────────────────────

    /// Walk the window one char at a time across unscanned history, hashing
    /// each chunk and testing recurrence clustering.
    fn analyze_chunks(&mut self) -> bool {
        while self.next_scan_index + self.chunk_size <= self.history.len() {
            let index = self.next_scan_index;
            let chunk: String = self.history[index..index + self.chunk_size]
                .iter()
                .collect();
            let hash = chunk_hash(&chunk);
            self.next_scan_index += 1;

            let Some(positions) = self.stats.get_mut(&hash) else {
                self.stats.insert(hash, vec![index]);
                continue;
            };

            // Collision guard: trust the hash only if the text really matches.
            let first = positions[0];
            let existing: String = self.history[first..first + self.chunk_size]
                .iter()
                .collect();
            if existing != chunk {
                continue;
            }

            positions.push(index);
            if positions.len() < self.loop_threshold {
                continue;
            }

            let recent = &positions[positions.len() - self.loop_threshold..];
            let total_gap: usize = recent.windows(2).map(|pair| pair[1] - pair[0]).sum();
            let average_gap = total_gap as f64 / (self.loop_threshold - 1) as f64;
            let max_allowed = self.chunk_size as f64 * MAX_AVG_GAP_FACTOR;
            if average_gap <= max_allowed {
                return true;
            }
        }
        false
    }
}

/// SHA-256 of the chunk, folded to a map key. Equality of the underlying
/// text is re-verified before the key is trusted.
fn chunk_hash(chunk: &str) -> u64 {
    let digest = Sha256::digest(chunk.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Longest run of one repeated character, ignoring whitespace and markdown
/// punctuation, reaches the degeneration threshold.
fn has_long_char_run(chars: &[char]) -> bool {
    let mut run_char = '\0';
    let mut run_len = 0usize;
    for &c in chars {
        if c == run_char {
            run_len += 1;
        } else {
            run_char = c;
            run_len = 1;
        }
        if run_len >= CHAR_RUN_THRESHOLD
            && !c.is_whitespace()
            && !MARKDOWN_RUN_CHARS.contains(&c)
        {
            return true;
        }
    }
    false
}
