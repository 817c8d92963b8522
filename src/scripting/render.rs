use std::collections::HashSet;
use std::fmt::Write;

use mlua::{MultiValue, Table, Value};

pub const MAX_RENDER_DEPTH: usize = 5;
pub const NO_RETURN_VALUE: &str = "[[No return value]]";
pub const NO_ENVIRONMENT_DATA: &str = "[[No environment data]]";

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Single-line rendering used for return values, keys and `print`.
pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => render_number(*n),
        Value::String(s) => s.to_string_lossy(),
        Value::Table(_) => "table".to_string(),
        Value::Function(_) => "function".to_string(),
        Value::Thread(_) => "thread".to_string(),
        Value::Error(e) => error_text(e),
        Value::LightUserData(p) if p.0.is_null() => "null".to_string(),
        _ => "userdata".to_string(),
    }
}

fn sorted_entries(table: &Table) -> Vec<(String, Value)> {
    let mut entries: Vec<(String, Value)> = table
        .clone()
        .pairs::<Value, Value>()
        .filter_map(Result::ok)
        .map(|(k, v)| (render_scalar(&k), v))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

fn render_table_into(out: &mut String, table: &Table, depth: usize) {
    let indent = "  ".repeat(depth);
    if depth > MAX_RENDER_DEPTH {
        let _ = writeln!(out, "{indent}...");
        return;
    }
    for (key, value) in sorted_entries(table) {
        match value {
            Value::Table(inner) => {
                let _ = writeln!(out, "{indent}{key}:");
                render_table_into(out, &inner, depth + 1);
            }
            other => {
                let _ = writeln!(out, "{indent}{key}: {}", render_scalar(&other));
            }
        }
    }
}

/// Nested, key-sorted dump of a table. Tables deeper than
/// [`MAX_RENDER_DEPTH`] collapse to `...`.
pub fn render_table(table: &Table) -> String {
    let mut out = String::new();
    render_table_into(&mut out, table, 0);
    if out.is_empty() {
        "{}".to_string()
    } else {
        out.trim_end().to_string()
    }
}

/// Renders an environment's globals, skipping names present at creation.
pub fn render_globals(globals: &Table, baseline: &HashSet<String>) -> String {
    let mut out = String::new();
    for (key, value) in sorted_entries(globals) {
        if baseline.contains(&key) {
            continue;
        }
        match value {
            Value::Table(inner) => {
                let _ = writeln!(out, "{key}:");
                render_table_into(&mut out, &inner, 1);
            }
            other => {
                let _ = writeln!(out, "{key}: {}", render_scalar(&other));
            }
        }
    }
    if out.is_empty() {
        "{}".to_string()
    } else {
        out.trim_end().to_string()
    }
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::Table(t) => render_table(t),
        other => render_scalar(other),
    }
}

/// `None` when the chunk produced no values.
pub fn render_values(values: &MultiValue) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Innermost message of a script error, without callback wrapping.
pub fn error_text(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => error_text(cause),
        mlua::Error::WithContext { cause, .. } => error_text(cause),
        mlua::Error::RuntimeError(msg) | mlua::Error::SyntaxError { message: msg, .. } => msg
            .split("\nstack traceback:")
            .next()
            .unwrap_or(msg)
            .to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::Lua;

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(render_scalar(&Value::Number(6.0)), "6");
        assert_eq!(render_scalar(&Value::Number(2.5)), "2.5");
        assert_eq!(render_scalar(&Value::Integer(-3)), "-3");
    }

    #[test]
    fn nested_tables_are_sorted_and_depth_capped() {
        let lua = Lua::new();
        let t: Table = lua
            .load("return { b = 2, a = { z = true, deep = {{{{{{ 'bottom' }}}}}} } }")
            .eval()
            .expect("table");
        let text = render_table(&t);
        let a = text.find("a:").expect("a key");
        let b = text.find("b: 2").expect("b key");
        assert!(a < b, "keys should be sorted: {text}");
        assert!(text.contains("z: true"));
        assert!(text.contains("..."), "depth cap missing: {text}");
        assert!(!text.contains("bottom"));
    }

    #[test]
    fn globals_skip_baseline_names() {
        let lua = Lua::new();
        let baseline: HashSet<String> = lua
            .globals()
            .pairs::<String, Value>()
            .filter_map(Result::ok)
            .map(|(k, _)| k)
            .collect();
        lua.load("x = 5; print = nil").exec().expect("exec");
        lua.globals().set("math", 1).expect("set");
        let text = render_globals(&lua.globals(), &baseline);
        assert!(text.contains("x: 5"));
        assert!(!text.contains("math"));
    }

    #[test]
    fn multiple_return_values_join_and_empty_is_none() {
        let lua = Lua::new();
        let values: MultiValue = lua.load("return 1, 'two'").eval().expect("eval");
        assert_eq!(render_values(&values).as_deref(), Some("1, two"));
        let none: MultiValue = lua.load("local y = 1").eval().expect("eval");
        assert_eq!(render_values(&none), None);
    }

    #[test]
    fn error_text_unwraps_callback_errors() {
        let lua = Lua::new();
        let f = lua
            .create_function(|_, ()| -> mlua::Result<()> {
                Err(mlua::Error::RuntimeError("boom".to_string()))
            })
            .expect("function");
        lua.globals().set("f", f).expect("set");
        let err = lua.load("f()").exec().expect_err("should fail");
        assert_eq!(error_text(&err), "boom");
    }
}
