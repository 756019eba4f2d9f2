//! Per-slot state machine and instruction planning.

use crate::fault::consistency_fault;
use crate::table::Hardware;
use pipemgr_hw::{InstrTarget, Instruction, MemType, PhysAddr, PipeResult};
use pipemgr_types::StageId;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Idle,
    SourceLatched,
    DestLatched,
    Copied,
    Rewritten,
    SourceInvalidated,
    Settled,
}

impl SlotState {
    pub fn can_transition(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, SourceLatched)
                | (Idle, DestLatched)
                | (Idle, Rewritten)
                | (SourceLatched, DestLatched)
                | (DestLatched, Copied)
                | (DestLatched, Rewritten)
                | (Copied, SourceInvalidated)
                | (Rewritten, SourceInvalidated)
                | (Copied, Settled)
                | (Rewritten, Settled)
                | (SourceInvalidated, Settled)
        )
    }

    pub fn transition(self, next: SlotState) -> PipeResult<SlotState> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(consistency_fault(format!(
                "illegal relocation transition {} -> {}",
                self, next
            )))
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Idle => "idle",
            SlotState::SourceLatched => "source-latched",
            SlotState::DestLatched => "dest-latched",
            SlotState::Copied => "copied",
            SlotState::Rewritten => "rewritten",
            SlotState::SourceInvalidated => "source-invalidated",
            SlotState::Settled => "settled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    /// Hardware line copy through the move registers.
    Copy,
    /// Re-encode the logical payload at the destination.
    Rewrite,
}

/// Everything needed to plan one relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveSpec {
    pub src: PhysAddr,
    pub dst: PhysAddr,
    pub mem_type: MemType,
    pub method: MoveMethod,
    /// Encoded destination words; required for [`MoveMethod::Rewrite`].
    pub words: Option<Vec<u8>>,
    pub drain_noops: u32,
}

impl MoveSpec {
    pub fn is_cross_stage(&self) -> bool {
        self.src.stage != self.dst.stage
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    /// State entered once the instruction is posted.
    pub state: SlotState,
    pub stage: StageId,
    pub instr: Instruction,
}

/// Ordered instruction sequence of one relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    steps: Vec<PlannedStep>,
    state: SlotState,
}

impl MovePlan {
    /// Plans a relocation. Pure: nothing is posted.
    pub fn build(spec: &MoveSpec) -> PipeResult<MovePlan> {
        let mut plan = MovePlan {
            steps: Vec::new(),
            state: SlotState::Idle,
        };
        let (src_stage, dst_stage) = (spec.src.stage, spec.dst.stage);
        let cross_stage = spec.is_cross_stage();

        match spec.method {
            MoveMethod::Copy => {
                if cross_stage {
                    return Err(consistency_fault(format!(
                        "line copy requested across stages {} -> {}",
                        src_stage, dst_stage
                    )));
                }
                plan.enter(SlotState::SourceLatched, src_stage, Instruction::LatchSource { addr: spec.src })?;
                plan.enter(SlotState::DestLatched, dst_stage, Instruction::LatchDest { addr: spec.dst })?;
                plan.enter(SlotState::Copied, dst_stage, Instruction::CopyLatched)?;
            }
            MoveMethod::Rewrite => {
                let words = spec.words.clone().ok_or_else(|| {
                    consistency_fault(format!("rewrite to {} without encoded words", spec.dst))
                })?;
                if !cross_stage {
                    plan.enter(SlotState::DestLatched, dst_stage, Instruction::LatchDest { addr: spec.dst })?;
                }
                plan.enter(
                    SlotState::Rewritten,
                    dst_stage,
                    Instruction::WriteWord {
                        addr: spec.dst,
                        data: words,
                    },
                )?;
            }
        }

        if spec.mem_type.needs_invalidate() {
            plan.enter(
                SlotState::SourceInvalidated,
                src_stage,
                Instruction::InvalidateTcam { addr: spec.src },
            )?;
        }

        let latched = !cross_stage;
        plan.state = plan.state.transition(SlotState::Settled)?;
        if latched {
            plan.push(dst_stage, Instruction::Unlatch);
        }
        for _ in 0..spec.drain_noops {
            plan.push(src_stage, Instruction::Noop);
        }
        Ok(plan)
    }

    fn enter(&mut self, next: SlotState, stage: StageId, instr: Instruction) -> PipeResult<()> {
        self.state = self.state.transition(next)?;
        self.push(stage, instr);
        Ok(())
    }

    fn push(&mut self, stage: StageId, instr: Instruction) {
        self.steps.push(PlannedStep {
            state: self.state,
            stage,
            instr,
        });
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn final_state(&self) -> SlotState {
        self.state
    }

    /// Instruction-buffer bytes the plan needs.
    pub fn encoded_len(&self) -> usize {
        self.steps.iter().map(|s| s.instr.encoded_len()).sum()
    }

    /// Posts every step in order. Stops at the first failure.
    pub fn execute(&self, hw: &mut Hardware, target: &InstrTarget) -> PipeResult<()> {
        for step in &self.steps {
            hw.post(&target.with_stage(step.stage), &step.instr)?;
        }
        Ok(())
    }
}
