//! Accumulating reply buffer with a pluggable completion predicate.
//!
//! The background reader appends one unit at a time; after every append the configured
//! [`ReplyChecker`] decides whether a complete reply is present. The completion flag is only
//! ever the result of that re-evaluation, so it cannot drift from the content.

use crate::error::{AppResult, ThermoError};
use std::fmt;
use std::sync::Arc;

/// Decides whether the accumulated units form a complete reply.
pub trait ReplyChecker: Send + Sync {
    /// Return true once `buffer` holds a complete reply.
    fn is_complete(&self, buffer: &[u8]) -> bool;
}

impl<F> ReplyChecker for F
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn is_complete(&self, buffer: &[u8]) -> bool {
        self(buffer)
    }
}

/// Default predicate: the buffer contains a terminator substring.
///
/// An empty terminator never matches.
#[derive(Debug, Clone)]
pub struct TerminatorChecker {
    terminator: Vec<u8>,
}

impl TerminatorChecker {
    /// Create a checker for the given terminator.
    pub fn new(terminator: &str) -> AppResult<Self> {
        Ok(Self {
            terminator: string_to_units(terminator)?,
        })
    }

    /// The terminator this checker looks for.
    pub fn terminator(&self) -> &[u8] {
        &self.terminator
    }
}

impl ReplyChecker for TerminatorChecker {
    fn is_complete(&self, buffer: &[u8]) -> bool {
        !self.terminator.is_empty()
            && buffer
                .windows(self.terminator.len())
                .any(|window| window == self.terminator.as_slice())
    }
}

/// Convert a string into link units, one unit per character.
///
/// # Errors
/// Returns [`ThermoError::InvalidCommand`] for characters above U+00FF.
pub fn string_to_units(text: &str) -> AppResult<Vec<u8>> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).map_err(|_| ThermoError::InvalidCommand(c)))
        .collect()
}

/// Convert link units into a string, one character per unit.
pub fn units_to_string(units: &[u8]) -> String {
    units.iter().copied().map(char::from).collect()
}

/// Buffer shared between the background reader and the caller waiting for a reply.
pub struct ReplyBuffer {
    data: Vec<u8>,
    capacity: usize,
    complete: bool,
    checker: Arc<dyn ReplyChecker>,
}

impl fmt::Debug for ReplyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyBuffer")
            .field("data", &units_to_string(&self.data))
            .field("capacity", &self.capacity)
            .field("complete", &self.complete)
            .finish()
    }
}

impl ReplyBuffer {
    /// Create an empty buffer.
    pub fn new(capacity: usize, checker: Arc<dyn ReplyChecker>) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            complete: false,
            checker,
        }
    }

    /// Append one unit and re-evaluate the completion predicate.
    ///
    /// Returns whether a complete reply is now present. Reaching capacity without a complete
    /// reply clears the buffer and fails with [`ThermoError::BufferOverflow`].
    pub fn push(&mut self, unit: u8) -> AppResult<bool> {
        self.data.push(unit);
        self.complete = self.checker.is_complete(&self.data);
        if !self.complete && self.data.len() >= self.capacity {
            self.clear();
            return Err(ThermoError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        Ok(self.complete)
    }

    /// Copy out the content and clear the buffer.
    pub fn take(&mut self) -> String {
        let reply = units_to_string(&self.data);
        self.clear();
        reply
    }

    /// Empty the buffer and reset the completion flag.
    pub fn clear(&mut self) {
        self.data.clear();
        self.complete = false;
    }

    /// Whether a complete reply is present.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of buffered units.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of units before overflow.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw buffered units.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cr_buffer(capacity: usize) -> ReplyBuffer {
        ReplyBuffer::new(capacity, Arc::new(TerminatorChecker::new("\r").unwrap()))
    }

    fn push_str(buffer: &mut ReplyBuffer, text: &str) -> AppResult<bool> {
        let mut complete = false;
        for unit in text.bytes() {
            complete = buffer.push(unit)?;
        }
        Ok(complete)
    }

    #[test]
    fn test_completes_on_terminator() {
        let mut buffer = cr_buffer(64);
        assert!(!push_str(&mut buffer, "23.5").unwrap());
        assert!(!buffer.is_complete());
        assert!(buffer.push(b'\r').unwrap());
        assert!(buffer.is_complete());
        assert_eq!(buffer.take(), "23.5\r");
        assert!(buffer.is_empty());
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_multi_unit_terminator() {
        let mut buffer =
            ReplyBuffer::new(64, Arc::new(TerminatorChecker::new("\r\n").unwrap()));
        assert!(!push_str(&mut buffer, "OK\r").unwrap());
        assert!(buffer.push(b'\n').unwrap());
    }

    #[test]
    fn test_overflow_clears_buffer() {
        let mut buffer = cr_buffer(4);
        assert!(!push_str(&mut buffer, "abc").unwrap());
        let err = buffer.push(b'd').unwrap_err();
        assert!(matches!(err, ThermoError::BufferOverflow { capacity: 4 }));
        assert!(buffer.is_empty());
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_reply_of_exactly_capacity_is_accepted() {
        let mut buffer = cr_buffer(4);
        assert!(push_str(&mut buffer, "abc\r").unwrap());
    }

    #[test]
    fn test_closure_checker() {
        let checker = |buf: &[u8]| buf.len() == 3;
        let mut buffer = ReplyBuffer::new(16, Arc::new(checker));
        assert!(!push_str(&mut buffer, "ab").unwrap());
        assert!(buffer.push(b'c').unwrap());
    }

    #[test]
    fn test_empty_terminator_never_matches() {
        let checker = TerminatorChecker::new("").unwrap();
        assert!(!checker.is_complete(b"anything"));
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(string_to_units("\u{4}00PV\u{5}").unwrap(), b"\x0400PV\x05");
        assert_eq!(units_to_string(&[0x02, b'P', 0xff]), "\u{2}P\u{ff}");
        assert!(matches!(
            string_to_units("temp°C\u{2603}"),
            Err(ThermoError::InvalidCommand('\u{2603}'))
        ));
    }
}
