// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `${name}` / `${env:NAME}` variable expansion over every string leaf of
//! the raw configuration document, run before typed deserialization.

use serde_json::{Map, Value};

use crate::error::NcpError;

pub fn expand_value(value: &mut Value, vars: &Map<String, Value>) -> Result<(), NcpError> {
    match value {
        Value::String(s) => {
            *s = expand_string(s, vars)?;
        }
        Value::Array(items) => {
            for item in items {
                expand_value(item, vars)?;
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_value(v, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_string(input: &str, vars: &Map<String, Value>) -> Result<String, NcpError> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let close = input[i..]
                .find('}')
                .map(|p| i + p)
                .ok_or_else(|| {
                    NcpError::InvalidConfiguration(format!("unterminated '${{' in '{input}'"))
                })?;
            let name = &input[i + 2..close];
            if let Some(env_name) = name.strip_prefix("env:") {
                let value = std::env::var(env_name).map_err(|_| {
                    NcpError::InvalidConfiguration(format!(
                        "undefined environment variable '{env_name}'"
                    ))
                })?;
                out.push_str(&value);
            } else {
                let value = vars.get(name).ok_or_else(|| {
                    NcpError::InvalidConfiguration(format!("undefined variable '{name}'"))
                })?;
                out.push_str(&value_to_string(value));
            }
            i = close + 1;
        } else {
            out.push(bytes[i] as char);
            i += 1;
        }
    }
    Ok(out)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_local_variable() {
        let vars = json!({"root": "build"}).as_object().cloned().unwrap();
        assert_eq!(expand_string("${root}/out", &vars).unwrap(), "build/out");
    }

    #[test]
    fn fails_on_undefined_variable() {
        let vars = Map::new();
        assert!(expand_string("${missing}", &vars).is_err());
    }

    #[test]
    fn expands_env_variable() {
        std::env::set_var("NCP_TEST_VAR", "hello");
        let vars = Map::new();
        assert_eq!(
            expand_string("${env:NCP_TEST_VAR}", &vars).unwrap(),
            "hello"
        );
    }

    #[test]
    fn recurses_into_nested_objects() {
        let vars = json!({"x": "1"}).as_object().cloned().unwrap();
        let mut value = json!({"a": ["${x}", {"b": "${x}"}]});
        expand_value(&mut value, &vars).unwrap();
        assert_eq!(value, json!({"a": ["1", {"b": "1"}]}));
    }
}
