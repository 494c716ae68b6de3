//! Input autocompletion.
//!
//! Providers inspect the current input line and offer completions; the
//! built-in providers cover command names and `/run <workflow>` targets.

use crate::manager::proto::AutocompleteItem;
use crate::manager::server::UIServer;

#[derive(Default)]
pub struct AutocompleteManager;

impl AutocompleteManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn get_completions(
        &self,
        server: &UIServer,
        text: &str,
        _row: usize,
        _col: usize,
    ) -> Vec<AutocompleteItem> {
        if let Some(items) = run_workflow_provider(server, text) {
            return items;
        }
        if let Some(items) = command_name_provider(server, text) {
            return items;
        }
        Vec::new()
    }
}

/// Complete workflow names after `/run `.
fn run_workflow_provider(server: &UIServer, text: &str) -> Option<Vec<AutocompleteItem>> {
    let rest = text.strip_prefix("/run")?;
    if !(rest.is_empty() || rest.starts_with(' ')) {
        return None;
    }
    let partial = rest.trim_start();
    let settings = server.manager().project().settings();
    let mut names: Vec<&String> = settings.workflows.keys().collect();
    names.sort();
    let items = names
        .into_iter()
        .filter(|name| name.starts_with(partial))
        .map(|name| AutocompleteItem {
            title: format!("/run {name} - workflow"),
            replace_start: 0,
            replace_text: text.to_string(),
            insert_text: format!("/run {name}"),
        })
        .collect();
    Some(items)
}

/// Complete command names for a bare `/` prefix.
fn command_name_provider(server: &UIServer, text: &str) -> Option<Vec<AutocompleteItem>> {
    let partial = text.strip_prefix('/')?;
    if partial.contains(' ') {
        return None;
    }
    let mut specs = server.commands().specs();
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    let items = specs
        .into_iter()
        .filter(|spec| spec.name.starts_with(partial))
        .map(|spec| AutocompleteItem {
            title: format!("/{} - {}", spec.name, spec.description),
            replace_start: 0,
            replace_text: text.to_string(),
            insert_text: format!("/{}", spec.name),
        })
        .collect();
    Some(items)
}
