//! Optimizer for queue-pointer-update instructions.
//!
//! Program execution produces a stream of pointer-variable updates
//! (advance this read pointer, wrap that one) that must reach the
//! io-queue headers in device DRAM. When the device loops a program
//! body, sending one command per instruction per iteration is wasteful
//! and, worse, re-sends updates the device already applies itself. The
//! passes here shrink the stream before emission:
//!
//! 1. **translate** — resolve instruction operands against the variable
//!    environment (operands must be compile-time-known), map instruction
//!    opcodes onto command opcodes, and drop instructions bound to no
//!    queue.
//! 2. **merge commutative** — adjacent updates to the same variable and
//!    queue set combine when the arithmetic allows it.
//! 3. **merge local/global** — a local-read-pointer update and a
//!    global-read-pointer update that advance the same queues by the same
//!    amounts become one command with both fields in its mask.
//!
//! The fourth pass — choosing inline versus external emission per queue —
//! lives in the loader, which owns the caches and queues it needs.

use std::collections::{BTreeSet, HashMap};

use log::{debug, trace, warn};

use crate::device::command::{HeaderField, HeaderFieldMask, PointerVarOpcode, QueueHeader};
use crate::error::{LoaderError, Result};

/// An instruction operand: a literal or a named program variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Const(u32),
    Var(String),
}

impl Operand {
    fn resolve(&self, vars: &HashMap<String, u32>) -> Result<u32> {
        match self {
            Operand::Const(value) => Ok(*value),
            Operand::Var(name) => vars.get(name).copied().ok_or_else(|| {
                LoaderError::Misuse(format!(
                    "pointer-update operand '{}' is not compile-time-known",
                    name
                ))
            }),
        }
    }
}

/// Arithmetic performed on a pointer variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerVarOp {
    IncWrap { amount: Operand, wrap: Operand },
    Inc { amount: Operand },
    Set { value: Operand },
    Add { lhs: Operand, rhs: Operand },
    Mul { lhs: Operand, rhs: Operand },
}

/// One program-level pointer-update instruction.
#[derive(Debug, Clone)]
pub struct PointerUpdateInstruction {
    pub variable: String,
    pub op: PointerVarOp,
}

impl PointerUpdateInstruction {
    /// Resolve to a command opcode and operand pair.
    pub fn opcode_and_operands(
        &self,
        vars: &HashMap<String, u32>,
    ) -> Result<(PointerVarOpcode, u32, u32)> {
        Ok(match &self.op {
            PointerVarOp::IncWrap { amount, wrap } => (
                PointerVarOpcode::IncWrap,
                amount.resolve(vars)?,
                wrap.resolve(vars)?,
            ),
            PointerVarOp::Inc { amount } => (PointerVarOpcode::Inc, amount.resolve(vars)?, 0),
            PointerVarOp::Set { value } => (PointerVarOpcode::Set, value.resolve(vars)?, 0),
            PointerVarOp::Add { lhs, rhs } => (
                PointerVarOpcode::Add,
                lhs.resolve(vars)?,
                rhs.resolve(vars)?,
            ),
            PointerVarOp::Mul { lhs, rhs } => (
                PointerVarOpcode::Mul,
                lhs.resolve(vars)?,
                rhs.resolve(vars)?,
            ),
        })
    }
}

/// Which cores must observe (and sync on) a header update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    Consumers,
    Producers,
    Both,
}

/// Cores that have to sync on an update to the given header field.
pub fn sync_scope_for_field(field: HeaderField) -> SyncScope {
    match field {
        HeaderField::GlobalRdptr | HeaderField::LocalRdptr | HeaderField::ZeroSetting => {
            SyncScope::Consumers
        }
        HeaderField::GlobalWrptr => SyncScope::Producers,
    }
}

/// A pending instruction together with the header field its variable is
/// bound to and the queues that variable controls.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub instruction: PointerUpdateInstruction,
    pub field: HeaderField,
    pub queues: BTreeSet<String>,
}

/// A translated update command, the unit the merge passes operate on.
#[derive(Debug, Clone)]
pub struct UpdateCommandInfo {
    pub var_name: String,
    pub opcode: PointerVarOpcode,
    pub operand_0: u32,
    pub operand_1: u32,
    pub field_mask: HeaderFieldMask,
    pub queues: BTreeSet<String>,
    pub sync_scope: SyncScope,
    /// Cleared when a merge absorbs this command.
    pub valid: bool,
}

impl UpdateCommandInfo {
    /// Whether this command can absorb `prev` (an earlier update to the
    /// same variable). Set/Add/Mul plainly overwrite; the increment forms
    /// require matching shape.
    fn is_commutative_with(&self, prev: &UpdateCommandInfo) -> bool {
        if self.queues != prev.queues {
            return false;
        }
        match self.opcode {
            PointerVarOpcode::IncWrap => {
                self.opcode == prev.opcode && self.operand_1 == prev.operand_1
            }
            PointerVarOpcode::Inc => self.opcode == prev.opcode,
            PointerVarOpcode::Set | PointerVarOpcode::Add | PointerVarOpcode::Mul => true,
        }
    }

    fn merge_commutative(&self, prev: &UpdateCommandInfo) -> UpdateCommandInfo {
        let mut merged = self.clone();
        match self.opcode {
            PointerVarOpcode::IncWrap | PointerVarOpcode::Inc => {
                merged.operand_0 = self.operand_0.wrapping_add(prev.operand_0);
            }
            PointerVarOpcode::Set | PointerVarOpcode::Add | PointerVarOpcode::Mul => {}
        }
        trace!(
            "merged {} updates: {:?}+{:?} -> {:?}",
            self.var_name,
            prev.operand_0,
            self.operand_0,
            merged.operand_0
        );
        merged
    }

    /// Whether `other` is the local/global read-pointer sibling of this
    /// command: complementary fields, identical arithmetic, same queues.
    fn is_local_global_sibling(&self, other: &UpdateCommandInfo) -> bool {
        self.valid
            && other.valid
            && self.field_mask.has(HeaderField::LocalRdptr)
                == other.field_mask.has(HeaderField::GlobalRdptr)
            && self.field_mask.has(HeaderField::GlobalRdptr)
                == other.field_mask.has(HeaderField::LocalRdptr)
            && self.queues == other.queues
            && self.opcode == other.opcode
            && self.operand_0 == other.operand_0
            && self.operand_1 == other.operand_1
    }

    /// Mirror the device-side effect of this command onto a host-cached
    /// header, `iterations` times for iteration-dependent opcodes.
    pub fn apply_to_header(&self, header: &mut QueueHeader, iterations: u32) {
        for field in [
            HeaderField::GlobalRdptr,
            HeaderField::GlobalWrptr,
            HeaderField::LocalRdptr,
            HeaderField::ZeroSetting,
        ] {
            if self.field_mask.has(field) {
                let mut value = header.field(field);
                self.opcode
                    .apply(&mut value, self.operand_0, self.operand_1, iterations);
                header.set_field(field, value);
            }
        }
    }
}

/// Pass 1: translate pending instructions into command infos, dropping
/// instructions bound to no queues.
pub fn translate_instructions(
    pending: &[PendingUpdate],
    vars: &HashMap<String, u32>,
) -> Result<Vec<UpdateCommandInfo>> {
    let mut commands = Vec::new();
    for update in pending {
        if update.queues.is_empty() {
            continue;
        }
        let (opcode, operand_0, operand_1) = update.instruction.opcode_and_operands(vars)?;
        commands.push(UpdateCommandInfo {
            var_name: update.instruction.variable.clone(),
            opcode,
            operand_0,
            operand_1,
            field_mask: HeaderFieldMask::single(update.field),
            queues: update.queues.clone(),
            sync_scope: sync_scope_for_field(update.field),
            valid: true,
        });
    }
    debug!("translated {} pointer updates", commands.len());
    Ok(commands)
}

/// Pass 2: merge adjacent commutative updates per variable.
pub fn merge_commutative(commands: &mut Vec<UpdateCommandInfo>) {
    let mut var_order: Vec<String> = Vec::new();
    let mut per_var: HashMap<String, Vec<UpdateCommandInfo>> = HashMap::new();
    for command in commands.drain(..) {
        if !per_var.contains_key(&command.var_name) {
            var_order.push(command.var_name.clone());
        }
        let merged = per_var.entry(command.var_name.clone()).or_default();
        match merged.last() {
            Some(prev) if command.is_commutative_with(prev) => {
                let combined = command.merge_commutative(prev);
                merged.pop();
                merged.push(combined);
            }
            _ => merged.push(command),
        }
    }
    for var in var_order {
        commands.extend(per_var.remove(&var).unwrap_or_default());
    }
    debug!("{} pointer updates after commutative merge", commands.len());
}

/// Pass 3: merge local/global read-pointer sibling commands into one
/// command carrying both fields.
pub fn merge_local_global(commands: &mut Vec<UpdateCommandInfo>) {
    // Per queue: which variable drives the local and the global read
    // pointer, and how many commands each variable has.
    let mut cmds_per_var: HashMap<String, usize> = HashMap::new();
    let mut var_for_queue_field: HashMap<(String, bool), String> = HashMap::new();
    for command in commands.iter() {
        *cmds_per_var.entry(command.var_name.clone()).or_insert(0) += 1;
        for queue in &command.queues {
            let global = command.field_mask.has(HeaderField::GlobalRdptr);
            let local = command.field_mask.has(HeaderField::LocalRdptr);
            if global || local {
                var_for_queue_field.insert((queue.clone(), global), command.var_name.clone());
            }
        }
    }

    for index in 0..commands.len() {
        let (global, local, first_queue, valid) = {
            let command = &commands[index];
            (
                command.field_mask.has(HeaderField::GlobalRdptr),
                command.field_mask.has(HeaderField::LocalRdptr),
                command.queues.iter().next().cloned(),
                command.valid,
            )
        };
        if (!global && !local) || !valid {
            continue;
        }
        let Some(first_queue) = first_queue else {
            continue;
        };
        let Some(sibling_var) = var_for_queue_field.get(&(first_queue, !global)).cloned() else {
            continue;
        };
        if cmds_per_var.get(&sibling_var).copied().unwrap_or(0) > 1 {
            // Multiple updates to the sibling variable make pairing
            // ambiguous; leave both streams alone.
            warn!(
                "skipping local/global merge for '{}': sibling '{}' has multiple updates",
                commands[index].var_name, sibling_var
            );
            continue;
        }
        let sibling_index = commands
            .iter()
            .position(|c| c.var_name == sibling_var && commands[index].is_local_global_sibling(c));
        if let Some(sibling_index) = sibling_index {
            if sibling_index == index {
                continue;
            }
            commands[sibling_index].valid = false;
            let command = &mut commands[index];
            command.field_mask.set(HeaderField::LocalRdptr);
            command.field_mask.set(HeaderField::GlobalRdptr);
            trace!(
                "merged local/global read-pointer updates '{}' and '{}'",
                command.var_name,
                sibling_var
            );
        }
    }

    commands.retain(|c| c.valid);
    debug!("{} pointer updates after local/global merge", commands.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queues(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn inc_update(var: &str, amount: u32, field: HeaderField, qs: &[&str]) -> PendingUpdate {
        PendingUpdate {
            instruction: PointerUpdateInstruction {
                variable: var.to_string(),
                op: PointerVarOp::IncWrap {
                    amount: Operand::Const(amount),
                    wrap: Operand::Const(16),
                },
            },
            field,
            queues: queues(qs),
        }
    }

    #[test]
    fn translate_resolves_variables() {
        let mut vars = HashMap::new();
        vars.insert("step".to_string(), 3u32);
        let pending = [PendingUpdate {
            instruction: PointerUpdateInstruction {
                variable: "lptr".to_string(),
                op: PointerVarOp::Inc {
                    amount: Operand::Var("step".to_string()),
                },
            },
            field: HeaderField::LocalRdptr,
            queues: queues(&["q0"]),
        }];
        let commands = translate_instructions(&pending, &vars).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].opcode, PointerVarOpcode::Inc);
        assert_eq!(commands[0].operand_0, 3);
        assert_eq!(commands[0].sync_scope, SyncScope::Consumers);
    }

    #[test]
    fn translate_rejects_unknown_variables() {
        let pending = [PendingUpdate {
            instruction: PointerUpdateInstruction {
                variable: "v".to_string(),
                op: PointerVarOp::Set {
                    value: Operand::Var("missing".to_string()),
                },
            },
            field: HeaderField::GlobalRdptr,
            queues: queues(&["q0"]),
        }];
        assert!(translate_instructions(&pending, &HashMap::new()).is_err());
    }

    #[test]
    fn translate_drops_unbound_instructions() {
        let pending = [inc_update("v", 1, HeaderField::GlobalRdptr, &[])];
        let commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        assert!(commands.is_empty());
    }

    #[test]
    fn commutative_incwrap_updates_sum() {
        let pending = [
            inc_update("v", 2, HeaderField::GlobalRdptr, &["q0", "q1"]),
            inc_update("v", 3, HeaderField::GlobalRdptr, &["q0", "q1"]),
        ];
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_commutative(&mut commands);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].operand_0, 5);
        assert_eq!(commands[0].operand_1, 16);
    }

    #[test]
    fn different_wrap_values_do_not_merge() {
        let mut pending = vec![
            inc_update("v", 2, HeaderField::GlobalRdptr, &["q0"]),
            inc_update("v", 3, HeaderField::GlobalRdptr, &["q0"]),
        ];
        if let PointerVarOp::IncWrap { wrap, .. } = &mut pending[1].instruction.op {
            *wrap = Operand::Const(8);
        }
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_commutative(&mut commands);
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn set_overwrites_previous_update() {
        let pending = [
            inc_update("v", 2, HeaderField::GlobalRdptr, &["q0"]),
            PendingUpdate {
                instruction: PointerUpdateInstruction {
                    variable: "v".to_string(),
                    op: PointerVarOp::Set {
                        value: Operand::Const(9),
                    },
                },
                field: HeaderField::GlobalRdptr,
                queues: queues(&["q0"]),
            },
        ];
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_commutative(&mut commands);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].opcode, PointerVarOpcode::Set);
        assert_eq!(commands[0].operand_0, 9);
    }

    #[test]
    fn local_and_global_siblings_merge() {
        let pending = [
            inc_update("lptr", 1, HeaderField::LocalRdptr, &["q0", "q1"]),
            inc_update("gptr", 1, HeaderField::GlobalRdptr, &["q0", "q1"]),
        ];
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_local_global(&mut commands);
        assert_eq!(commands.len(), 1);
        assert!(commands[0].field_mask.has(HeaderField::LocalRdptr));
        assert!(commands[0].field_mask.has(HeaderField::GlobalRdptr));
    }

    #[test]
    fn sibling_with_different_amount_does_not_merge() {
        let pending = [
            inc_update("lptr", 1, HeaderField::LocalRdptr, &["q0"]),
            inc_update("gptr", 2, HeaderField::GlobalRdptr, &["q0"]),
        ];
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_local_global(&mut commands);
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn ambiguous_sibling_streams_left_alone() {
        // Both variables carry multiple updates, so pairing would be
        // ambiguous in both directions and nothing merges.
        let pending = [
            inc_update("lptr", 1, HeaderField::LocalRdptr, &["q0"]),
            inc_update("lptr", 2, HeaderField::LocalRdptr, &["q0"]),
            inc_update("gptr", 1, HeaderField::GlobalRdptr, &["q0"]),
            inc_update("gptr", 2, HeaderField::GlobalRdptr, &["q0"]),
        ];
        let mut commands = translate_instructions(&pending, &HashMap::new()).unwrap();
        merge_local_global(&mut commands);
        assert_eq!(commands.len(), 4);
    }

    #[test]
    fn apply_mirrors_device_arithmetic() {
        let mut commands = translate_instructions(
            &[inc_update("v", 3, HeaderField::GlobalRdptr, &["q0"])],
            &HashMap::new(),
        )
        .unwrap();
        merge_commutative(&mut commands);
        let mut header = QueueHeader::default();
        header.set_field(HeaderField::GlobalRdptr, 14);
        commands[0].apply_to_header(&mut header, 2);
        // (14+3)%16=1, (1+3)%16=4
        assert_eq!(header.field(HeaderField::GlobalRdptr), 4);
    }
}
