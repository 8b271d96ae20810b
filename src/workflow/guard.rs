/// Guard conditions for DAG tasks
///
/// Deliberately tiny: `{{tasks.<name>.status}}` and `{{tasks.<name>.exitCode}}`
/// placeholders are substituted, then the result must be `true`, `false`, or a
/// single `==` / `!=` comparison of two literals.

use crate::workflow::types::NodePhase;

/// What a guard may know about a sibling task
#[derive(Debug, Clone, Copy)]
pub struct TaskFacts {
    pub phase: NodePhase,
    pub exit_code: Option<i32>,
}

/// Evaluate `expr`, resolving task references through `lookup`
pub fn evaluate<F>(expr: &str, lookup: F) -> Result<bool, String>
where
    F: Fn(&str) -> Option<TaskFacts>,
{
    let resolved = substitute(expr, &lookup)?;
    let resolved = resolved.trim();

    if let Some((lhs, rhs)) = resolved.split_once("!=") {
        return Ok(literal(lhs) != literal(rhs));
    }
    if let Some((lhs, rhs)) = resolved.split_once("==") {
        return Ok(literal(lhs) == literal(rhs));
    }
    match literal(resolved).as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("cannot evaluate guard '{}' (resolved to '{}')", expr, other)),
    }
}

fn substitute<F>(expr: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<TaskFacts>,
{
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| format!("unterminated placeholder in '{}'", expr))?;
        out.push_str(&resolve(after[..end].trim(), lookup)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve<F>(reference: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<TaskFacts>,
{
    let parts: Vec<&str> = reference.split('.').collect();
    match parts.as_slice() {
        ["tasks", task, field] => {
            let facts = lookup(task).ok_or_else(|| format!("unknown task '{}' in guard", task))?;
            match *field {
                "status" => Ok(facts.phase.to_string()),
                "exitCode" => Ok(facts
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_default()),
                other => Err(format!("unsupported task field '{}'", other)),
            }
        }
        _ => Err(format!("unsupported reference '{{{{{}}}}}'", reference)),
    }
}

fn literal(s: &str) -> String {
    s.trim().trim_matches(|c| c == '"' || c == '\'').to_string()
}
