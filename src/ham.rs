//! HAM conflict resolution
//!
//! The per-field last-writer-wins algebra. Two replicas merging the same pair of
//! nodes reach the same result regardless of message order: the decision depends
//! only on the per-field timestamps, the machine identities, and a deterministic
//! value comparison, never on arrival order or wall clock.
//!
//! Tie-break chain for equal timestamps: greater machine state, then greater
//! machine id (lexicographic), then the type-rank/value ordering of
//! [`Value::ham_cmp`]. A tie at every level keeps the current value.

use crate::node::{Meta, Node};
use crate::types::Value;
use std::cmp::Ordering;

/// Which side a field-level decision picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Current,
    Incoming,
}

/// Decide one field. `cur_val` is `None` when the field is absent on the current
/// node, in which case any incoming write wins.
pub fn ham(
    field: &str,
    cur_val: Option<&Value>,
    inc_val: &Value,
    cur_meta: &Meta,
    inc_meta: &Meta,
) -> Side {
    let cur_val = match cur_val {
        Some(v) => v,
        None => return Side::Incoming,
    };
    let t_cur = cur_meta.state_of(field);
    let t_inc = inc_meta.state_of(field);
    if t_inc > t_cur {
        return Side::Incoming;
    }
    if t_cur > t_inc {
        return Side::Current;
    }
    match inc_meta.machine_state.cmp(&cur_meta.machine_state) {
        Ordering::Greater => return Side::Incoming,
        Ordering::Less => return Side::Current,
        Ordering::Equal => {}
    }
    match inc_meta.machine_id.cmp(&cur_meta.machine_id) {
        Ordering::Greater => return Side::Incoming,
        Ordering::Less => return Side::Current,
        Ordering::Equal => {}
    }
    match inc_val.ham_cmp(cur_val) {
        Ordering::Greater => Side::Incoming,
        _ => Side::Current,
    }
}

/// Result of merging one node into another.
#[derive(Clone, Debug)]
pub struct Merge {
    pub node: Node,
    /// Fields whose stored value changed, in field order.
    pub changed: Vec<String>,
}

/// Merge `incoming` into `current`, field by field.
///
/// Infallible: malformed inputs must be rejected before this point. The merged
/// state map holds the max timestamp per field, and the machine markers follow
/// the side owning the greater machine state (current on ties), so the winning
/// writer stays attributable.
pub fn merge_nodes(current: &Node, incoming: &Node) -> Merge {
    let mut merged = current.clone();
    let mut changed = Vec::new();

    for (field, inc_val) in &incoming.fields {
        let side = ham(field, current.get(field), inc_val, &current.meta, &incoming.meta);
        let t_cur = current.meta.state_of(field);
        let t_inc = incoming.meta.state_of(field);
        merged.meta.state.insert(field.clone(), t_cur.max(t_inc));
        if side == Side::Incoming {
            let replaced = merged.fields.insert(field.clone(), inc_val.clone());
            if replaced.as_ref() != Some(inc_val) {
                changed.push(field.clone());
            }
        }
    }

    if incoming.meta.machine_state > current.meta.machine_state {
        merged.meta.machine_state = incoming.meta.machine_state;
        merged.meta.machine_id = incoming.meta.machine_id.clone();
    }

    Merge { node: merged, changed }
}
