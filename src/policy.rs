// src/policy.rs

use serde_json::Value;

use crate::error::{OidcFedError, Result};

/// Applies one `metadata_policy` block to a metadata object, in place.
///
/// Operators run per parameter in the federation-prescribed order:
/// `value`, `add`, `default`, `one_of`, `subset_of`, `superset_of`,
/// `essential`. Policies along a chain are applied by calling this once per
/// statement, trust anchor first.
pub fn apply_metadata_policy(metadata: &mut Value, policy: &Value) -> Result<()> {
    let Some(policy) = policy.as_object() else {
        return Err(violation("metadata_policy is not an object"));
    };

    if !metadata.is_object() {
        *metadata = Value::Object(serde_json::Map::new());
    }

    for (param, operators) in policy {
        let Some(operators) = operators.as_object() else {
            return Err(violation(&format!(
                "policy for parameter {param} is not an object"
            )));
        };

        if let Some(value) = operators.get("value") {
            set_param(metadata, param, value.clone());
        }

        if let Some(add) = operators.get("add") {
            apply_add(metadata, param, add)?;
        }

        if let Some(default) = operators.get("default") {
            if metadata.get(param).is_none() {
                set_param(metadata, param, default.clone());
            }
        }

        if let Some(one_of) = operators.get("one_of") {
            apply_one_of(metadata, param, one_of)?;
        }

        if let Some(subset_of) = operators.get("subset_of") {
            apply_subset_of(metadata, param, subset_of)?;
        }

        if let Some(superset_of) = operators.get("superset_of") {
            apply_superset_of(metadata, param, superset_of)?;
        }

        if operators.get("essential").and_then(Value::as_bool) == Some(true)
            && metadata.get(param).is_none()
        {
            return Err(violation(&format!(
                "essential parameter {param} is missing"
            )));
        }
    }

    Ok(())
}

fn set_param(metadata: &mut Value, param: &str, value: Value) {
    if let Some(map) = metadata.as_object_mut() {
        map.insert(param.to_string(), value);
    }
}

fn remove_param(metadata: &mut Value, param: &str) {
    if let Some(map) = metadata.as_object_mut() {
        map.remove(param);
    }
}

fn apply_add(metadata: &mut Value, param: &str, add: &Value) -> Result<()> {
    let additions: Vec<Value> = match add {
        Value::Array(values) => values.clone(),
        other => vec![other.clone()],
    };

    let mut current = match metadata.get(param) {
        None => Vec::new(),
        Some(Value::Array(values)) => values.clone(),
        Some(other) => vec![other.clone()],
    };

    for value in additions {
        if !current.contains(&value) {
            current.push(value);
        }
    }

    set_param(metadata, param, Value::Array(current));
    Ok(())
}

fn apply_one_of(metadata: &mut Value, param: &str, one_of: &Value) -> Result<()> {
    let Some(choices) = one_of.as_array() else {
        return Err(violation(&format!("one_of for {param} is not an array")));
    };

    if let Some(value) = metadata.get(param) {
        if !choices.contains(value) {
            return Err(violation(&format!(
                "value of {param} is not among the one_of choices"
            )));
        }
    }

    Ok(())
}

fn apply_subset_of(metadata: &mut Value, param: &str, subset_of: &Value) -> Result<()> {
    let Some(allowed) = subset_of.as_array() else {
        return Err(violation(&format!(
            "subset_of for {param} is not an array"
        )));
    };

    let Some(value) = metadata.get(param) else {
        return Ok(());
    };

    let current: Vec<Value> = match value {
        Value::Array(values) => values.clone(),
        other => vec![other.clone()],
    };

    let filtered: Vec<Value> = current
        .into_iter()
        .filter(|v| allowed.contains(v))
        .collect();

    if filtered.is_empty() {
        remove_param(metadata, param);
    } else {
        set_param(metadata, param, Value::Array(filtered));
    }

    Ok(())
}

fn apply_superset_of(metadata: &mut Value, param: &str, superset_of: &Value) -> Result<()> {
    let Some(required) = superset_of.as_array() else {
        return Err(violation(&format!(
            "superset_of for {param} is not an array"
        )));
    };

    let Some(value) = metadata.get(param) else {
        return Ok(());
    };

    let current: Vec<Value> = match value {
        Value::Array(values) => values.clone(),
        other => vec![other.clone()],
    };

    for needed in required {
        if !current.contains(needed) {
            return Err(violation(&format!(
                "value of {param} does not contain required element {needed}"
            )));
        }
    }

    Ok(())
}

fn violation(reason: &str) -> OidcFedError {
    OidcFedError::MissingMetadata(format!("metadata policy violation: {reason}"))
}
