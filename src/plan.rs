//! Query plan cost evaluation
//!
//! Works on the document returned by `EXPLAIN (FORMAT JSON)`:
//!
//! ```text
//! [{"Plan": {"Node Type": "Seq Scan", "Total Cost": 35.5, "Plans": [...]}}]
//! ```
//!
//! Every node's "Total Cost" is summed, children included, so the result is
//! at least the planner's own root estimate.

use serde_json::Value;

use crate::error::{Error, Result};

/// Sum of "Total Cost" across every node of every plan in the document.
pub fn total_cost(explain: &Value) -> Result<f64> {
    let entries = explain
        .as_array()
        .ok_or_else(|| Error::Plan(format!("expected a JSON array, got {}", explain)))?;

    let mut cost = 0.0;
    for entry in entries {
        let root = entry
            .get("Plan")
            .ok_or_else(|| Error::Plan(format!("missing \"Plan\" in {}", entry)))?;
        cost += node_cost(root)?;
    }
    Ok(cost)
}

fn node_cost(node: &Value) -> Result<f64> {
    let own = node
        .get("Total Cost")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::Plan(format!("node without numeric \"Total Cost\": {}", node)))?;

    let children = match node.get("Plans") {
        Some(Value::Array(plans)) => plans.iter().map(node_cost).sum::<Result<f64>>()?,
        Some(other) => return Err(Error::Plan(format!("\"Plans\" is not an array: {}", other))),
        None => 0.0,
    };

    Ok(own + children)
}

/// Fail with [`Error::PlanCostExceeded`] when the plan costs more than `budget`.
/// Returns the computed cost otherwise.
pub fn enforce(budget: f64, statement: &str, explain: &Value) -> Result<f64> {
    let cost = total_cost(explain)?;
    if cost > budget {
        return Err(Error::PlanCostExceeded {
            budget,
            cost,
            statement: statement.to_string(),
            plan: explain.to_string(),
        });
    }
    Ok(cost)
}
