//! Hardware fixtures
//!
//! `RecordingTransport` keeps its log behind an `Arc<Mutex<..>>` so a test
//! can hand the transport to the code under test and still inspect what was
//! posted through a [`TransportLog`] handle.

use pipemgr_hw::{
    EncodeTarget, EntryData, EntryEncoder, InstrTarget, Instruction, InstructionTransport,
    PhysAddr, PipeError, PipeResult, PipeStatus, ResourceKind, ResourceSpec,
};
use pipemgr_types::{DevId, PipeBitmap, StageId};
use std::sync::{Arc, Mutex, MutexGuard};

/// Default outbound buffer capacity used by fixtures.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// One posted instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedInstr {
    pub target: InstrTarget,
    pub instr: Instruction,
}

#[derive(Debug, Default)]
struct LogState {
    posted: Vec<PostedInstr>,
    pending: usize,
    flushed: usize,
    flushes: usize,
    discards: usize,
    discarded: usize,
}

/// Shared view of a [`RecordingTransport`]'s log
#[derive(Debug, Clone, Default)]
pub struct TransportLog {
    state: Arc<Mutex<LogState>>,
}

impl TransportLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        // A poisoned lock only means another test thread panicked
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every instruction still in the log (discarded ones are dropped)
    pub fn posted(&self) -> Vec<PostedInstr> {
        self.lock().posted.clone()
    }

    /// Only the instructions
    pub fn instructions(&self) -> Vec<Instruction> {
        self.lock().posted.iter().map(|p| p.instr.clone()).collect()
    }

    /// Number of instructions handed to hardware by a flush
    pub fn flushed_count(&self) -> usize {
        self.lock().flushed
    }

    /// Number of instructions queued since the last flush
    pub fn pending_count(&self) -> usize {
        self.lock().pending
    }

    /// Number of flush calls
    pub fn flushes(&self) -> usize {
        self.lock().flushes
    }

    /// Number of discard calls
    pub fn discards(&self) -> usize {
        self.lock().discards
    }

    /// Number of instructions dropped by discards
    pub fn discarded_count(&self) -> usize {
        self.lock().discarded
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        *self.lock() = LogState::default();
    }
}

/// Instruction transport that records every post
#[derive(Debug)]
pub struct RecordingTransport {
    log: TransportLog,
    capacity: usize,
    fail_after: Option<usize>,
    accepted: usize,
}

impl RecordingTransport {
    /// Create a transport with [`DEFAULT_CAPACITY`]
    pub fn new() -> Self {
        Self {
            log: TransportLog::default(),
            capacity: DEFAULT_CAPACITY,
            fail_after: None,
            accepted: 0,
        }
    }

    /// Set the outbound buffer capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Accept `n` more posts, then fail every post with `PIPE_COMM_FAIL`
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Handle to the shared log
    pub fn log(&self) -> TransportLog {
        self.log.clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionTransport for RecordingTransport {
    fn post(&mut self, target: &InstrTarget, instr: &Instruction) -> PipeResult<()> {
        if let Some(limit) = self.fail_after {
            if self.accepted >= limit {
                return Err(PipeError::transport(
                    PipeStatus::HwCommFail,
                    format!("injected failure posting {}", instr),
                ));
            }
        }
        self.accepted += 1;
        let mut state = self.log.lock();
        state.posted.push(PostedInstr {
            target: *target,
            instr: instr.clone(),
        });
        state.pending += 1;
        Ok(())
    }

    fn flush(&mut self) -> PipeResult<()> {
        let mut state = self.log.lock();
        state.flushed += state.pending;
        state.pending = 0;
        state.flushes += 1;
        Ok(())
    }

    fn discard(&mut self) {
        let mut state = self.log.lock();
        let keep = state.posted.len() - state.pending;
        state.posted.truncate(keep);
        state.discarded += state.pending;
        state.pending = 0;
        state.discards += 1;
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Reversible encoder with a simple byte layout
///
/// `[action_fn: u32 le][len: u8][action_data][n_res: u8]([kind: u8][has_idx: u8][idx: u32 le])*`
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeEncoder;

fn kind_code(kind: ResourceKind) -> u8 {
    match kind {
        ResourceKind::Counter => 0,
        ResourceKind::Meter => 1,
        ResourceKind::Stateful => 2,
        ResourceKind::Selector => 3,
        ResourceKind::IdleTime => 4,
    }
}

fn kind_from_code(code: u8) -> Option<ResourceKind> {
    match code {
        0 => Some(ResourceKind::Counter),
        1 => Some(ResourceKind::Meter),
        2 => Some(ResourceKind::Stateful),
        3 => Some(ResourceKind::Selector),
        4 => Some(ResourceKind::IdleTime),
        _ => None,
    }
}

fn take<'a>(words: &mut &'a [u8], n: usize) -> PipeResult<&'a [u8]> {
    if words.len() < n {
        return Err(PipeError::invalid_argument("truncated entry words"));
    }
    let (head, tail) = words.split_at(n);
    *words = tail;
    Ok(head)
}

fn take_u32(words: &mut &[u8]) -> PipeResult<u32> {
    let bytes = take(words, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

impl EntryEncoder for FakeEncoder {
    fn encode(&self, _target: &EncodeTarget, data: &EntryData) -> PipeResult<Vec<u8>> {
        if data.action_data.len() > u8::MAX as usize || data.resources.len() > u8::MAX as usize {
            return Err(PipeError::invalid_argument("payload too large for fake encoder"));
        }
        let mut words = Vec::with_capacity(6 + data.action_data.len() + data.resources.len() * 6);
        words.extend_from_slice(&data.action_fn.to_le_bytes());
        words.push(data.action_data.len() as u8);
        words.extend_from_slice(&data.action_data);
        words.push(data.resources.len() as u8);
        for res in &data.resources {
            words.push(kind_code(res.kind));
            words.push(u8::from(res.index.is_some()));
            words.extend_from_slice(&res.index.unwrap_or(0).to_le_bytes());
        }
        Ok(words)
    }

    fn decode(&self, _addr: &PhysAddr, words: &[u8]) -> PipeResult<EntryData> {
        let mut rest = words;
        let action_fn = take_u32(&mut rest)?;
        let len = take(&mut rest, 1)?[0] as usize;
        let action_data = take(&mut rest, len)?.to_vec();
        let n_res = take(&mut rest, 1)?[0];
        let mut resources = Vec::with_capacity(n_res as usize);
        for _ in 0..n_res {
            let head = take(&mut rest, 2)?;
            let kind = kind_from_code(head[0])
                .ok_or_else(|| PipeError::invalid_argument("unknown resource kind"))?;
            let has_index = head[1] != 0;
            let index = take_u32(&mut rest)?;
            resources.push(ResourceSpec {
                kind,
                index: has_index.then_some(index),
            });
        }
        Ok(EntryData {
            action_fn,
            action_data,
            resources,
        })
    }
}

/// Target on device 0 covering `num_pipes` pipes
pub fn target(num_pipes: u8, stage: u8) -> InstrTarget {
    InstrTarget::new(DevId::new(0), PipeBitmap::all(num_pipes), StageId::new(stage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipemgr_hw::MemType;
    use pipemgr_types::{StageIndex, TableHandle};
    use pretty_assertions::assert_eq;

    fn addr() -> PhysAddr {
        PhysAddr {
            pipe: 0,
            stage: StageId::new(1),
            mem_type: MemType::Sram,
            mem_id: 0,
            line: 0,
            subword: 0,
        }
    }

    #[test]
    fn test_encoder_round_trip() {
        let data = EntryData::new(7, vec![1, 2, 3])
            .with_resource(ResourceSpec::direct(ResourceKind::Counter))
            .with_resource(ResourceSpec::indirect(ResourceKind::Meter, 12));
        let tgt = EncodeTarget {
            table: TableHandle::new(1),
            index: StageIndex::new(0),
            addr: addr(),
        };
        let words = FakeEncoder.encode(&tgt, &data).unwrap();
        assert_eq!(FakeEncoder.decode(&addr(), &words).unwrap(), data);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(FakeEncoder.decode(&addr(), &[1, 0]).is_err());
    }

    #[test]
    fn test_fail_after() {
        let mut t = RecordingTransport::new().fail_after(1);
        let tgt = target(1, 0);
        assert!(t.post(&tgt, &Instruction::Noop).is_ok());
        let err = t.post(&tgt, &Instruction::Noop).unwrap_err();
        assert_eq!(err.status(), PipeStatus::HwCommFail);
        assert_eq!(t.log().posted().len(), 1);
    }

    #[test]
    fn test_flush_and_discard() {
        let mut t = RecordingTransport::new();
        let log = t.log();
        let tgt = target(2, 0);
        t.post(&tgt, &Instruction::Noop).unwrap();
        t.flush().unwrap();
        t.post(&tgt, &Instruction::Unlatch).unwrap();
        t.discard();

        assert_eq!(log.flushed_count(), 1);
        assert_eq!(log.discarded_count(), 1);
        assert_eq!(log.instructions(), vec![Instruction::Noop]);
        assert_eq!(log.pending_count(), 0);
    }
}
