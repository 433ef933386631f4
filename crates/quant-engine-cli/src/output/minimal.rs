use serde_json::{Map, Value};

/// Print the headline of a result: weights for optimizations, the terminal
/// distribution for simulations, tail risk for risk reports.
pub fn print_minimal(value: &Value) {
    let result = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    let Value::Object(res) = result else {
        println!("{}", scalar(result));
        return;
    };

    if let Some(Value::Object(weights)) = res.get("weights") {
        for (symbol, w) in weights {
            println!("{} {}", symbol, scalar(w));
        }
        if let Some(Value::String(status)) = res.get("status") {
            if status != "converged" {
                eprintln!("status: {}", status);
            }
        }
        return;
    }

    if let Some(Value::Object(summary)) = res.get("summary") {
        print_pairs(summary, &["mean_terminal", "std_terminal", "probability_of_loss"]);
        return;
    }

    if let Some(Value::Object(mc)) = res.get("monte_carlo") {
        print_pairs(mc, &["price", "std_error"]);
        print_pairs(res, &["black_scholes"]);
        return;
    }

    if res.contains_key("cvar") {
        print_pairs(res, &["var", "cvar", "max_drawdown", "sharpe_ratio"]);
        return;
    }

    if let Some(v) = res.get("constraints_satisfied") {
        println!("{}", scalar(v));
        return;
    }

    if let Some((key, val)) = res.iter().find(|(_, v)| !v.is_null()) {
        println!("{}: {}", key, scalar(val));
    }
}

fn print_pairs(map: &Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if let Some(v) = map.get(*key) {
            println!("{} {}", key, scalar(v));
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
