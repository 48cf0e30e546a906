//! Config and I/O schema validation for the function node.
//!
//! Supported type expressions: `string`, `number`, `boolean`, `object`,
//! and `array<T>` where `T` is one of the base types.

use serde_json::Value;

use super::{FunctionErrorCode, FunctionNodeError, InputBinding, OutputBinding};
use crate::types::{new_var_map, VarMap};
use crate::vars::VariablePool;

const BASE_TYPES: &[&str] = &["string", "number", "boolean", "object"];

pub(super) fn validate_config(
    function_ref: &str,
    inputs: &[InputBinding],
    outputs: &[OutputBinding],
) -> Result<(), FunctionNodeError> {
    let invalid = |message: String| FunctionNodeError::new(FunctionErrorCode::InvalidConfig, message);

    if function_ref.trim().is_empty() {
        return Err(invalid("function_ref is required".into()));
    }
    if inputs.is_empty() {
        return Err(invalid("inputs is required and cannot be empty".into()));
    }
    if outputs.is_empty() {
        return Err(invalid("outputs is required and cannot be empty".into()));
    }

    let mut seen = std::collections::HashSet::new();
    for input in inputs {
        if input.name.trim().is_empty() {
            return Err(invalid("input name is required".into()));
        }
        if !seen.insert(input.name.clone()) {
            return Err(invalid(format!("duplicate input name: {}", input.name)));
        }
        validate_type_expr(&input.value_type)?;
        if input.required && !input.value_selector.is_valid() && input.default.is_none() {
            return Err(invalid(format!(
                "required input needs value_selector or default: {}",
                input.name
            )));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for output in outputs {
        if output.name.trim().is_empty() {
            return Err(invalid("output name is required".into()));
        }
        if !seen.insert(output.name.clone()) {
            return Err(invalid(format!("duplicate output name: {}", output.name)));
        }
        validate_type_expr(&output.value_type)?;
    }

    Ok(())
}

pub(super) fn validate_type_expr(type_expr: &str) -> Result<(), FunctionNodeError> {
    let t = type_expr.trim();
    if t.is_empty() {
        return Err(FunctionNodeError::new(
            FunctionErrorCode::InvalidConfig,
            "type expression is required".into(),
        ));
    }
    if BASE_TYPES.contains(&t) {
        return Ok(());
    }
    if let Some(inner) = t.strip_prefix("array<").and_then(|s| s.strip_suffix('>')) {
        if BASE_TYPES.contains(&inner) {
            return Ok(());
        }
        return Err(FunctionNodeError::new(
            FunctionErrorCode::InvalidConfig,
            format!("unsupported array inner type: {inner}"),
        ));
    }
    Err(FunctionNodeError::new(
        FunctionErrorCode::InvalidConfig,
        format!("unsupported type expression: {t}"),
    ))
}

/// Resolve declared inputs against the pool (falling back to defaults)
/// and type-check each present value.
pub(super) fn build_and_validate_inputs(
    pool: &VariablePool,
    bindings: &[InputBinding],
) -> Result<VarMap, FunctionNodeError> {
    let mut inputs = new_var_map();

    for binding in bindings {
        let mut value = None;
        if binding.value_selector.is_valid() {
            value = pool.get(&binding.value_selector);
        }
        if value.is_none() {
            value = binding.default.clone();
        }

        let Some(value) = value else {
            if binding.required {
                return Err(FunctionNodeError::new(
                    FunctionErrorCode::InputMissing,
                    format!("missing required input: {}", binding.name),
                ));
            }
            continue;
        };

        validate_value_type(&binding.value_type, &value).map_err(|cause| {
            FunctionNodeError::new(
                FunctionErrorCode::InputTypeMismatch,
                format!("input type mismatch: {}: {cause}", binding.name),
            )
        })?;
        inputs.insert(binding.name.clone(), value);
    }

    Ok(inputs)
}

/// Check declared outputs against the raw result; in strict mode any
/// undeclared extra field is rejected.
pub(super) fn validate_and_filter_outputs(
    raw: VarMap,
    bindings: &[OutputBinding],
    strict: bool,
) -> Result<VarMap, FunctionNodeError> {
    let mut filtered = new_var_map();

    for binding in bindings {
        let Some(value) = raw.get(&binding.name) else {
            if binding.required {
                return Err(FunctionNodeError::new(
                    FunctionErrorCode::OutputMissing,
                    format!("missing required output: {}", binding.name),
                ));
            }
            continue;
        };
        validate_value_type(&binding.value_type, value).map_err(|cause| {
            FunctionNodeError::new(
                FunctionErrorCode::OutputTypeMismatch,
                format!("output type mismatch: {}: {cause}", binding.name),
            )
        })?;
        filtered.insert(binding.name.clone(), value.clone());
    }

    if strict {
        for key in raw.keys() {
            if !bindings.iter().any(|b| &b.name == key) {
                return Err(FunctionNodeError::new(
                    FunctionErrorCode::StrictSchemaViolation,
                    format!("extra output field not declared: {key}"),
                ));
            }
        }
    }

    Ok(filtered)
}

pub(super) fn validate_value_type(type_expr: &str, value: &Value) -> Result<(), String> {
    if value.is_null() {
        return Err("value is null".to_string());
    }

    let t = type_expr.trim();
    if let Some(inner) = t.strip_prefix("array<").and_then(|s| s.strip_suffix('>')) {
        let Value::Array(items) = value else {
            return Err(format!("expected array, got {}", type_name(value)));
        };
        for (i, item) in items.iter().enumerate() {
            validate_base_type(inner, item)
                .map_err(|got| format!("expected array<{inner}>, index {i} got {got}"))?;
        }
        return Ok(());
    }

    validate_base_type(t, value).map_err(|got| format!("expected {t}, got {got}"))
}

fn validate_base_type(base: &str, value: &Value) -> Result<(), String> {
    let ok = match base {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(type_name(value).to_string())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
