use crate::dep::Trackable;
use crate::error::TemplateError;
use crate::task::Task;

/// Expands `{depends}`, `{targets}`, `{dep:N}`, `{targets:N}`, and `{name}` placeholders in a
/// command template against `task`'s resolved dependencies/targets.
pub fn expand(tmpl: &str, task: &Task) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(tmpl.len());
    let bytes = tmpl.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'{' {
            let close = tmpl[i..]
                .find('}')
                .map(|rel| i + rel)
                .ok_or(TemplateError::Unterminated(i))?;
            let placeholder = &tmpl[i + 1..close];
            out.push_str(&resolve_placeholder(placeholder, task)?);
            i = close + 1;
        } else {
            let ch_len = tmpl[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            out.push_str(&tmpl[i..i + ch_len]);
            i += ch_len;
        }
    }

    Ok(out)
}

fn resolve_placeholder(placeholder: &str, task: &Task) -> Result<String, TemplateError> {
    match placeholder {
        "depends" => Ok(join_names(task.depends.iter().map(|d| d.name()))),
        "targets" => Ok(join_names(task.targets.iter().map(|d| d.name()))),
        "name" => Ok(task.name.clone()),
        _ => {
            if let Some(index) = placeholder.strip_prefix("dep:") {
                return indexed(index, &task.depends, "dep");
            }
            if let Some(index) = placeholder.strip_prefix("targets:") {
                return indexed(index, &task.targets, "targets");
            }
            Err(TemplateError::UnknownPlaceholder(placeholder.to_string()))
        },
    }
}

fn indexed(
    index: &str,
    items: &[std::sync::Arc<crate::dep::Dep>],
    kind: &'static str,
) -> Result<String, TemplateError> {
    let n: usize = index
        .parse()
        .map_err(|_| TemplateError::UnknownPlaceholder(format!("{kind}:{index}")))?;
    items
        .get(n)
        .map(|d| d.name().to_string())
        .ok_or(TemplateError::IndexOutOfRange {
            kind,
            index: n,
            len: items.len(),
        })
}

fn join_names<'a>(mut names: impl Iterator<Item = &'a str>) -> String {
    use itertools::Itertools;
    names.join(" ")
}
