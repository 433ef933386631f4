use serde_json::{Map, Value};
use std::io;

type StdoutWriter<'a> = csv::Writer<io::StdoutLock<'a>>;

/// Write output as CSV to stdout.
///
/// Optimization results become one row per symbol, simulations one row
/// per time step, and anything else a flattened field/value listing.
pub fn print_csv(value: &Value) {
    let stdout = io::stdout();
    let mut wtr = csv::Writer::from_writer(stdout.lock());

    let result = value
        .as_object()
        .and_then(|m| m.get("result"))
        .and_then(Value::as_object);

    let written = match result {
        Some(res) if res.contains_key("weights") => write_weights(&mut wtr, res),
        Some(res) if res.contains_key("summary") => write_paths(&mut wtr, res),
        Some(res) => write_fields(&mut wtr, res),
        None => match value {
            Value::Object(map) => write_fields(&mut wtr, map),
            other => wtr.write_record([format_csv_value(other)]),
        },
    };

    if let Err(e) = written.and_then(|_| wtr.flush().map_err(csv::Error::from)) {
        eprintln!("CSV write error: {}", e);
    }
}

fn write_weights(wtr: &mut StdoutWriter<'_>, res: &Map<String, Value>) -> csv::Result<()> {
    let Some(Value::Object(weights)) = res.get("weights") else {
        return write_fields(wtr, res);
    };
    let contributions = res
        .get("metrics")
        .and_then(|m| m.get("risk_contributions"))
        .and_then(Value::as_object);

    wtr.write_record(["symbol", "weight", "risk_contribution"])?;
    for (symbol, w) in weights {
        let rc = contributions
            .and_then(|c| c.get(symbol))
            .map(format_csv_value)
            .unwrap_or_default();
        wtr.write_record([symbol.clone(), format_csv_value(w), rc])?;
    }
    Ok(())
}

fn write_paths(wtr: &mut StdoutWriter<'_>, res: &Map<String, Value>) -> csv::Result<()> {
    let mean_path = res
        .get("summary")
        .and_then(|s| s.get("mean_path"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let samples: Vec<&Vec<Value>> = res
        .get("sample_paths")
        .and_then(Value::as_array)
        .map(|paths| paths.iter().filter_map(Value::as_array).collect())
        .unwrap_or_default();

    let mut header = vec!["step".to_string(), "mean".to_string()];
    header.extend((0..samples.len()).map(|i| format!("path_{}", i)));
    wtr.write_record(&header)?;

    for (step, mean) in mean_path.iter().enumerate() {
        let mut row = vec![step.to_string(), format_csv_value(mean)];
        row.extend(
            samples
                .iter()
                .map(|p| p.get(step).map(format_csv_value).unwrap_or_default()),
        );
        wtr.write_record(&row)?;
    }
    Ok(())
}

fn write_fields(wtr: &mut StdoutWriter<'_>, map: &Map<String, Value>) -> csv::Result<()> {
    wtr.write_record(["field", "value"])?;
    let mut rows = Vec::new();
    flatten("", map, &mut rows);
    for (key, val) in rows {
        wtr.write_record([key, val])?;
    }
    Ok(())
}

fn flatten(prefix: &str, map: &Map<String, Value>, rows: &mut Vec<(String, String)>) {
    for (key, val) in map {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match val {
            Value::Object(inner) => flatten(&name, inner, rows),
            _ => rows.push((name, format_csv_value(val))),
        }
    }
}

fn format_csv_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
