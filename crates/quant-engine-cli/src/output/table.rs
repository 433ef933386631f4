use colored::Colorize;
use serde_json::{Map, Value};
use tabled::{builder::Builder, Table};

/// Sections of a result printed as their own symbol/value tables.
const KEYED_SECTIONS: [&str; 3] = ["weights", "expected_returns", "volatilities"];

/// Format output as tables using the tabled crate.
pub fn print_table(value: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(result) = map.get("result") {
                print_result_table(result, map);
            } else {
                print_flat_object(map);
            }
        }
        Value::Array(arr) => print_array_table(arr),
        _ => println!("{}", value),
    }
}

fn print_result_table(result: &Value, envelope: &Map<String, Value>) {
    let Value::Object(res_map) = result else {
        print_flat_object(envelope);
        return;
    };

    if let Some(Value::String(status)) = res_map.get("status") {
        let label = match status.as_str() {
            "converged" => status.green().bold(),
            "timed_out" => status.yellow().bold(),
            _ => status.red().bold(),
        };
        println!("Status: {}", label);
    }

    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    for (key, val) in res_map {
        if KEYED_SECTIONS.contains(&key.as_str()) || key == "status" {
            continue;
        }
        match val {
            Value::Object(inner) if !inner.is_empty() => {
                for (k, v) in inner {
                    builder.push_record([format!("{}.{}", key, k), format_value(v)]);
                }
            }
            _ => builder.push_record([key.clone(), format_value(val)]),
        }
    }
    println!("{}", Table::from(builder));

    for section in KEYED_SECTIONS {
        if let Some(Value::Object(entries)) = res_map.get(section) {
            let mut builder = Builder::default();
            builder.push_record(["Symbol", section]);
            for (symbol, v) in entries {
                builder.push_record([symbol.clone(), format_value(v)]);
            }
            println!("\n{}", Table::from(builder));
        }
    }

    if let Some(Value::Array(warnings)) = envelope.get("warnings") {
        if !warnings.is_empty() {
            println!("\n{}", "Warnings:".yellow());
            for w in warnings {
                if let Value::String(s) = w {
                    println!("  - {}", s);
                }
            }
        }
    }

    if let Some(Value::String(meth)) = envelope.get("methodology") {
        println!("\nMethodology: {}", meth);
    }
}

fn print_flat_object(map: &Map<String, Value>) {
    let mut builder = Builder::default();
    builder.push_record(["Field", "Value"]);
    for (key, val) in map {
        builder.push_record([key.clone(), format_value(val)]);
    }
    println!("{}", Table::from(builder));
}

fn print_array_table(arr: &[Value]) {
    if arr.is_empty() {
        println!("(empty)");
        return;
    }

    if let Some(Value::Object(first)) = arr.first() {
        let headers: Vec<String> = first.keys().cloned().collect();
        let mut builder = Builder::default();
        builder.push_record(headers.clone());
        for item in arr {
            if let Value::Object(map) = item {
                let row: Vec<String> = headers
                    .iter()
                    .map(|h| map.get(h.as_str()).map(format_value).unwrap_or_default())
                    .collect();
                builder.push_record(row);
            }
        }
        println!("{}", Table::from(builder));
    } else {
        for item in arr {
            println!("{}", format_value(item));
        }
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{:.6}", f),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "-".to_string(),
        Value::Array(arr) if arr.len() <= 8 => {
            let items: Vec<String> = arr.iter().map(format_value).collect();
            items.join(", ")
        }
        Value::Array(arr) => format!("[{} items]", arr.len()),
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}
