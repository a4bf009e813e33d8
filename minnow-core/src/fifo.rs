//! Bounded token queue with transactional consumption.
//!
//! A [`Fifo`] is a ring of `N` slots addressed by three free-running `u32`
//! counters, each reduced `% N` when indexing:
//!
//! ```text
//!   read_pos  <=  tentative_read_pos  <=  write_pos  <=  read_pos + N - 1
//!   |-- peeked, not yet committed --|-- unread --|
//! ```
//!
//! There are two consumers of the same counters:
//!
//! - **Local** consumption by the owning actor: [`Fifo::peek`] advances the
//!   tentative position, [`Fifo::commit_read`] releases everything peeked,
//!   [`Fifo::cancel_commit`] rolls all peeks back.
//! - **Remote** consumption driven by a network peer through sequence numbers:
//!   [`Fifo::com_peek`] hands out `(sequence, token)`, and the peer's
//!   acknowledgement calls [`Fifo::com_commit_read`] or
//!   [`Fifo::com_cancel_read`] with that sequence. On the receiving side
//!   [`Fifo::com_write`] only accepts the sequence number it expects next.
//!
//! Sequence mismatches are rejected with an error and leave the queue
//! untouched; they are never reordered or silently corrected.

use rmpv::Value;

use crate::codec::{map_of, CodecError, ValueExt};
use crate::token::Token;

/// Queue type name used in serialized port state.
pub const QUEUE_TYPE: &str = "fanout_fifo";

/// Errors reported by FIFO operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FifoError {
    /// No free slot for a write.
    #[error("fifo is full")]
    Full,

    /// Commit requested with no outstanding tentative read.
    #[error("nothing to commit")]
    NothingToCommit,

    /// Remote write for a sequence number that was already written.
    #[error("stale sequence number {seq}, write position is {write_pos}")]
    Stale {
        /// Received sequence number.
        seq: u32,
        /// Current write position.
        write_pos: u32,
    },

    /// Remote write skipping ahead of the write position.
    #[error("out of order sequence number {seq}, expected {expected}")]
    OutOfOrder {
        /// Received sequence number.
        seq: u32,
        /// Sequence number the queue expects.
        expected: u32,
    },

    /// Remote commit for a sequence number other than the read boundary.
    #[error("commit of sequence number {seq} does not match read position {read_pos}")]
    CommitMismatch {
        /// Acknowledged sequence number.
        seq: u32,
        /// Current read position.
        read_pos: u32,
    },

    /// Remote cancel outside the in-flight window.
    #[error("cancel of sequence number {seq} outside in-flight window [{read_pos}, {tentative_read_pos})")]
    CancelOutOfWindow {
        /// Rejected sequence number.
        seq: u32,
        /// Current read position.
        read_pos: u32,
        /// Current tentative read position.
        tentative_read_pos: u32,
    },

    /// Capacity below the two slots needed to hold one token, or above the
    /// limit a restored queue may claim.
    #[error("invalid fifo size {0}")]
    InvalidSize(u32),

    /// Serialized queue state could not be used.
    #[error("invalid queue state: {0}")]
    InvalidState(String),
}

impl From<CodecError> for FifoError {
    fn from(e: CodecError) -> Self {
        FifoError::InvalidState(e.to_string())
    }
}

/// Fixed-capacity circular buffer of tokens.
#[derive(Debug, Clone)]
pub struct Fifo {
    slots: Vec<Option<Token>>,
    write_pos: u32,
    read_pos: u32,
    tentative_read_pos: u32,
}

impl Fifo {
    /// Create an empty queue with `size` slots (one of them always stays free).
    pub fn new(size: u32) -> Result<Self, FifoError> {
        if size < 2 {
            return Err(FifoError::InvalidSize(size));
        }
        Ok(Self {
            slots: vec![None; size as usize],
            write_pos: 0,
            read_pos: 0,
            tentative_read_pos: 0,
        })
    }

    /// Number of slots `N`.
    pub fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Next sequence number to be written.
    pub fn write_pos(&self) -> u32 {
        self.write_pos
    }

    /// First sequence number not yet released.
    pub fn read_pos(&self) -> u32 {
        self.read_pos
    }

    /// Next sequence number to be peeked.
    pub fn tentative_read_pos(&self) -> u32 {
        self.tentative_read_pos
    }

    fn index(&self, pos: u32) -> usize {
        (pos % self.size()) as usize
    }

    fn used(&self) -> u32 {
        self.write_pos.wrapping_sub(self.read_pos)
    }

    fn in_flight(&self) -> u32 {
        self.tentative_read_pos.wrapping_sub(self.read_pos)
    }

    /// Whether `n` slots can be written.
    pub fn slots_available(&self, n: u32) -> bool {
        self.size() - self.used() - 1 >= n
    }

    /// Whether `n` tokens can be peeked.
    pub fn tokens_available(&self, n: u32) -> bool {
        self.write_pos.wrapping_sub(self.tentative_read_pos) >= n
    }

    /// Append a token.
    pub fn write(&mut self, token: Token) -> Result<(), FifoError> {
        if !self.slots_available(1) {
            return Err(FifoError::Full);
        }
        let idx = self.index(self.write_pos);
        self.slots[idx] = Some(token);
        self.write_pos = self.write_pos.wrapping_add(1);
        Ok(())
    }

    /// Tentatively read the next token; the slot stays reserved until commit.
    pub fn peek(&mut self) -> Option<Token> {
        if !self.tokens_available(1) {
            return None;
        }
        let token = self.slots[self.index(self.tentative_read_pos)].clone();
        self.tentative_read_pos = self.tentative_read_pos.wrapping_add(1);
        token
    }

    /// Release every slot peeked since the last commit.
    pub fn commit_read(&mut self) -> Result<(), FifoError> {
        if self.in_flight() == 0 {
            return Err(FifoError::NothingToCommit);
        }
        while self.read_pos != self.tentative_read_pos {
            let idx = self.index(self.read_pos);
            self.slots[idx] = None;
            self.read_pos = self.read_pos.wrapping_add(1);
        }
        Ok(())
    }

    /// Undo every peek since the last commit.
    pub fn cancel_commit(&mut self) {
        self.tentative_read_pos = self.read_pos;
    }

    /// Tentatively read the next token together with its sequence number.
    pub fn com_peek(&mut self) -> Option<(u32, Token)> {
        let seq = self.tentative_read_pos;
        self.peek().map(|token| (seq, token))
    }

    /// Write a token received from a peer under sequence number `seq`.
    ///
    /// Only `seq == write_pos` is accepted. Lower numbers are retransmits of
    /// tokens already written ([`FifoError::Stale`]); higher numbers would
    /// leave a gap ([`FifoError::OutOfOrder`]).
    pub fn com_write(&mut self, token: Token, seq: u32) -> Result<(), FifoError> {
        // Signed distance so the comparison survives counter wrap-around.
        let distance = seq.wrapping_sub(self.write_pos) as i32;
        if distance < 0 {
            return Err(FifoError::Stale {
                seq,
                write_pos: self.write_pos,
            });
        }
        if distance > 0 {
            return Err(FifoError::OutOfOrder {
                seq,
                expected: self.write_pos,
            });
        }
        self.write(token)
    }

    /// Release the slot for `seq` after the peer acknowledged it.
    pub fn com_commit_read(&mut self, seq: u32) -> Result<(), FifoError> {
        if seq != self.read_pos || self.in_flight() == 0 {
            return Err(FifoError::CommitMismatch {
                seq,
                read_pos: self.read_pos,
            });
        }
        let idx = self.index(self.read_pos);
        self.slots[idx] = None;
        self.read_pos = self.read_pos.wrapping_add(1);
        Ok(())
    }

    /// Roll tentative reads back to `seq` after the peer refused it.
    pub fn com_cancel_read(&mut self, seq: u32) -> Result<(), FifoError> {
        let offset = seq.wrapping_sub(self.read_pos);
        if offset >= self.in_flight() {
            return Err(FifoError::CancelOutOfWindow {
                seq,
                read_pos: self.read_pos,
                tentative_read_pos: self.tentative_read_pos,
            });
        }
        self.tentative_read_pos = seq;
        Ok(())
    }

    /// Serialize as a `fanout_fifo` queue description for a single reader.
    pub fn to_value(&self, reader: &str) -> Result<Value, FifoError> {
        let mut tokens = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match slot {
                Some(token) => tokens.push(map_of([
                    ("type", Value::from("Token")),
                    ("data", token.to_value().map_err(|e| FifoError::InvalidState(e.to_string()))?),
                ])),
                None => tokens.push(Value::Nil),
            }
        }
        Ok(map_of([
            ("queuetype", Value::from(QUEUE_TYPE)),
            ("N", Value::from(self.size())),
            ("fifo", Value::Array(tokens)),
            ("write_pos", Value::from(self.write_pos)),
            ("readers", Value::Array(vec![Value::from(reader)])),
            ("read_pos", map_of([(reader, Value::from(self.read_pos))])),
            (
                "tentative_read_pos",
                map_of([(reader, Value::from(self.tentative_read_pos))]),
            ),
        ]))
    }

    /// Rebuild a queue from its serialized description.
    ///
    /// Read positions are taken from the first listed reader; a queue
    /// without readers starts with both read positions at zero. A size `N`
    /// above `max_size` is refused before any slot is allocated.
    pub fn from_value(queue: &Value, max_size: u32) -> Result<Self, FifoError> {
        let queuetype = queue.get_str("queuetype")?;
        if queuetype != QUEUE_TYPE {
            return Err(FifoError::InvalidState(format!(
                "unsupported queue type '{}'",
                queuetype
            )));
        }

        let size = queue.get_u32("N")?;
        if size > max_size {
            return Err(FifoError::InvalidSize(size));
        }
        let mut fifo = Fifo::new(size)?;
        fifo.write_pos = queue.get_u32("write_pos")?;

        let readers = queue.get_array("readers")?;
        if let Some(reader) = readers.first().and_then(Value::as_str) {
            fifo.read_pos = queue.get_value("read_pos")?.get_u32(reader)?;
            fifo.tentative_read_pos = queue.get_value("tentative_read_pos")?.get_u32(reader)?;
        } else {
            fifo.read_pos = fifo.write_pos;
            fifo.tentative_read_pos = fifo.write_pos;
        }

        if fifo.used() >= fifo.size() || fifo.in_flight() > fifo.used() {
            return Err(FifoError::InvalidState(format!(
                "positions out of range: write {} read {} tentative {}",
                fifo.write_pos, fifo.read_pos, fifo.tentative_read_pos
            )));
        }

        let tokens = queue.get_array("fifo")?;
        let mut pos = fifo.read_pos;
        while pos != fifo.write_pos {
            let idx = fifo.index(pos);
            let slot = tokens
                .get(idx)
                .ok_or_else(|| FifoError::InvalidState(format!("missing token {}", idx)))?;
            let data = if slot.has_key("data") {
                slot.get_value("data")?
            } else {
                slot
            };
            let token = Token::from_value(data).map_err(|e| FifoError::InvalidState(e.to_string()))?;
            fifo.slots[idx] = Some(token);
            pos = pos.wrapping_add(1);
        }

        Ok(fifo)
    }
}
