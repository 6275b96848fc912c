use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::path::{parse_index, Pointer};
use crate::{ErrorKind, ReplicantError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpMethod {
    Overwrite,
    Add,
    Update,
    Delete,
    CopyWithin,
    Fill,
    Pop,
    Push,
    Reverse,
    Shift,
    Sort,
    Splice,
    Unshift,
}

impl OpMethod {
    pub fn is_sequence_mutator(&self) -> bool {
        matches!(
            self,
            OpMethod::CopyWithin
                | OpMethod::Fill
                | OpMethod::Pop
                | OpMethod::Push
                | OpMethod::Reverse
                | OpMethod::Shift
                | OpMethod::Sort
                | OpMethod::Splice
                | OpMethod::Unshift
        )
    }
}

/// Per-method payload. `overwrite`/`add`/`update` carry the affected property
/// and the new value, `delete` the property alone, and sequence mutators the
/// literal arguments passed to the mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpArgs {
    Assign {
        prop: String,
        #[serde(rename = "newValue")]
        new_value: JsonValue,
    },
    Mutator {
        prop: String,
        #[serde(rename = "mutatorArgs")]
        mutator_args: Vec<JsonValue>,
    },
    Overwrite {
        #[serde(rename = "newValue")]
        new_value: JsonValue,
    },
    Delete {
        prop: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub path: String,
    pub method: OpMethod,
    pub args: OpArgs,
}

impl Operation {
    pub fn assign(path: &Pointer, prop: &str, new_value: JsonValue, existing: bool) -> Self {
        Self {
            path: path.render(),
            method: if existing { OpMethod::Update } else { OpMethod::Add },
            args: OpArgs::Assign {
                prop: prop.to_string(),
                new_value,
            },
        }
    }

    pub fn delete(path: &Pointer, prop: &str) -> Self {
        Self {
            path: path.render(),
            method: OpMethod::Delete,
            args: OpArgs::Delete {
                prop: prop.to_string(),
            },
        }
    }

    pub fn overwrite(new_value: JsonValue) -> Self {
        Self {
            path: Pointer::root().render(),
            method: OpMethod::Overwrite,
            args: OpArgs::Overwrite { new_value },
        }
    }

    pub fn sequence(path: &Pointer, method: OpMethod, mutator_args: Vec<JsonValue>) -> Self {
        debug_assert!(method.is_sequence_mutator());
        Self {
            path: path.render(),
            method,
            args: OpArgs::Mutator {
                prop: path.last().unwrap_or_default().to_string(),
                mutator_args,
            },
        }
    }

    pub fn pointer(&self) -> Result<Pointer, ReplicantError> {
        Pointer::parse(&self.path)
    }
}

/// Broadcast envelope: one accepted batch from the authoritative side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub namespace: String,
    pub name: String,
    pub revision: u64,
    pub operations: Vec<Operation>,
}

/// Subscriber-side flush: proposed mutations awaiting authoritative acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalEnvelope {
    pub namespace: String,
    pub name: String,
    pub operations: Vec<Operation>,
}

/// Replays one operation against a bare value tree. This is the path used for
/// schema dry runs, subscriber-side apply, and replay-equivalence checks; the
/// live tree goes through the same semantics with ownership tracking layered
/// on top.
pub fn apply_operation(
    value: &mut Option<JsonValue>,
    operation: &Operation,
) -> Result<(), ReplicantError> {
    let pointer = operation.pointer()?;

    if operation.method == OpMethod::Overwrite {
        let OpArgs::Overwrite { new_value } = &operation.args else {
            return Err(args_mismatch(operation));
        };
        if !pointer.is_root() {
            return Err(ReplicantError::internal(format!(
                "overwrite is only valid at the root path, got '{}'",
                operation.path
            )));
        }
        *value = Some(new_value.clone());
        return Ok(());
    }

    let Some(root) = value.as_mut() else {
        return Err(ReplicantError::internal(format!(
            "cannot apply {:?} at '{}': value is undefined",
            operation.method, operation.path
        )));
    };
    let Some(target) = pointer.resolve_mut(root) else {
        return Err(ReplicantError::internal(format!(
            "path '{}' does not resolve",
            operation.path
        )));
    };

    match operation.method {
        OpMethod::Add | OpMethod::Update => {
            let OpArgs::Assign { prop, new_value } = &operation.args else {
                return Err(args_mismatch(operation));
            };
            assign_property(target, prop, new_value.clone(), &operation.path)
        }
        OpMethod::Delete => {
            let OpArgs::Delete { prop } = &operation.args else {
                return Err(args_mismatch(operation));
            };
            delete_property(target, prop, &operation.path)
        }
        method if method.is_sequence_mutator() => {
            let OpArgs::Mutator { mutator_args, .. } = &operation.args else {
                return Err(args_mismatch(operation));
            };
            let JsonValue::Array(items) = target else {
                return Err(ReplicantError::internal(format!(
                    "{:?} target at '{}' is not a sequence",
                    method, operation.path
                )));
            };
            seq_mutate(items, method, mutator_args, |value| value, sort_render)
        }
        _ => unreachable!("overwrite handled above"),
    }
}

pub(crate) fn assign_property(
    target: &mut JsonValue,
    prop: &str,
    new_value: JsonValue,
    path: &str,
) -> Result<(), ReplicantError> {
    match target {
        JsonValue::Object(map) => {
            map.insert(prop.to_string(), new_value);
            Ok(())
        }
        JsonValue::Array(items) => {
            let Some(index) = parse_index(prop) else {
                return Err(ReplicantError::internal(format!(
                    "'{prop}' is not a valid sequence index at '{path}'"
                )));
            };
            if index < items.len() {
                items[index] = new_value;
            } else if index == items.len() {
                items.push(new_value);
            } else {
                return Err(ReplicantError::internal(format!(
                    "index {index} is out of bounds at '{path}'"
                )));
            }
            Ok(())
        }
        _ => Err(ReplicantError::internal(format!(
            "cannot assign property '{prop}' at '{path}': target is not a composite"
        ))),
    }
}

pub(crate) fn delete_property(
    target: &mut JsonValue,
    prop: &str,
    path: &str,
) -> Result<(), ReplicantError> {
    match target {
        JsonValue::Object(map) => {
            map.remove(prop);
            Ok(())
        }
        JsonValue::Array(_) => Err(ReplicantError::internal(format!(
            "delete is not supported on sequences at '{path}'; use splice"
        ))),
        _ => Err(ReplicantError::internal(format!(
            "cannot delete property '{prop}' at '{path}': target is not a composite"
        ))),
    }
}

/// Rendered form used as the default `sort` comparator key, mirroring the
/// string conversion the source runtime sorts by.
pub(crate) fn sort_render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// The nine recognized sequence mutators, generic over the element type so the
/// live tree can mirror structural bookkeeping through the same index
/// arithmetic. Negative `start`/`end`/`target` arguments count from the end of
/// the sequence and ranges clamp, as in the source runtime.
pub(crate) fn seq_mutate<T, F, K>(
    items: &mut Vec<T>,
    method: OpMethod,
    args: &[JsonValue],
    mut from_json: F,
    sort_key: K,
) -> Result<(), ReplicantError>
where
    T: Clone,
    F: FnMut(JsonValue) -> T,
    K: Fn(&T) -> String,
{
    let len = items.len();
    match method {
        OpMethod::CopyWithin => {
            let target = normalize_index(required_int(args, 0, "copyWithin target")?, len);
            let start = normalize_index(optional_int(args, 1, "copyWithin start")?.unwrap_or(0), len);
            let end = normalize_index(
                optional_int(args, 2, "copyWithin end")?.unwrap_or(len as i64),
                len,
            );
            let count = end.saturating_sub(start).min(len - target);
            if count > 0 {
                let window: Vec<T> = items[start..start + count].to_vec();
                items.splice(target..target + count, window);
            }
            Ok(())
        }
        OpMethod::Fill => {
            let fill_value = args.first().cloned().ok_or_else(|| {
                ReplicantError::internal("fill requires a value argument")
            })?;
            let start = normalize_index(optional_int(args, 1, "fill start")?.unwrap_or(0), len);
            let end =
                normalize_index(optional_int(args, 2, "fill end")?.unwrap_or(len as i64), len);
            for slot in items.iter_mut().take(end).skip(start) {
                *slot = from_json(fill_value.clone());
            }
            Ok(())
        }
        OpMethod::Pop => {
            items.pop();
            Ok(())
        }
        OpMethod::Push => {
            for arg in args {
                items.push(from_json(arg.clone()));
            }
            Ok(())
        }
        OpMethod::Reverse => {
            items.reverse();
            Ok(())
        }
        OpMethod::Shift => {
            if !items.is_empty() {
                items.remove(0);
            }
            Ok(())
        }
        OpMethod::Sort => {
            items.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
            Ok(())
        }
        OpMethod::Splice => {
            let Some(start_raw) = optional_int(args, 0, "splice start")? else {
                return Ok(());
            };
            let start = normalize_index(start_raw, len);
            let delete_count = match optional_int(args, 1, "splice deleteCount")? {
                Some(count) => (count.max(0) as usize).min(len - start),
                None => len - start,
            };
            let inserted: Vec<T> = args[2.min(args.len())..]
                .iter()
                .map(|arg| from_json(arg.clone()))
                .collect();
            items.splice(start..start + delete_count, inserted);
            Ok(())
        }
        OpMethod::Unshift => {
            for (offset, arg) in args.iter().enumerate() {
                items.insert(offset, from_json(arg.clone()));
            }
            Ok(())
        }
        other => Err(ReplicantError::internal(format!(
            "{other:?} is not a sequence mutator"
        ))),
    }
}

fn normalize_index(relative: i64, len: usize) -> usize {
    if relative < 0 {
        len.saturating_sub(relative.unsigned_abs() as usize)
    } else {
        (relative as usize).min(len)
    }
}

fn required_int(args: &[JsonValue], index: usize, what: &str) -> Result<i64, ReplicantError> {
    optional_int(args, index, what)?
        .ok_or_else(|| ReplicantError::internal(format!("{what} is required")))
}

fn optional_int(
    args: &[JsonValue],
    index: usize,
    what: &str,
) -> Result<Option<i64>, ReplicantError> {
    match args.get(index) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or_else(|| {
            ReplicantError::new(ErrorKind::Internal, format!("{what} must be an integer"))
        }),
    }
}

fn args_mismatch(operation: &Operation) -> ReplicantError {
    ReplicantError::internal(format!(
        "args payload does not match method {:?} at '{}'",
        operation.method, operation.path
    ))
}
