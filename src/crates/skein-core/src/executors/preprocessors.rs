//! Prompt preprocessors.
//!
//! A preprocessor is a named transform applied to the collected message
//! list before it is serialized for the provider. Registration is
//! per-process; nodes reference preprocessors by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::PreprocessorSpec;
use crate::project::ProjectContext;
use crate::state::Message;

/// Transform callback: `(project, spec, messages) -> messages`.
pub type PreprocessorFn =
    Arc<dyn Fn(&dyn ProjectContext, &PreprocessorSpec, Vec<Message>) -> Vec<Message> + Send + Sync>;

#[derive(Clone)]
pub struct Preprocessor {
    pub name: String,
    pub description: String,
    pub func: PreprocessorFn,
}

/// Registry of named preprocessors.
#[derive(Clone, Default)]
pub struct PreprocessorRegistry {
    entries: HashMap<String, Preprocessor>,
}

impl PreprocessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, description: &str, func: F)
    where
        F: Fn(&dyn ProjectContext, &PreprocessorSpec, Vec<Message>) -> Vec<Message>
            + Send
            + Sync
            + 'static,
    {
        self.entries.insert(
            name.to_string(),
            Preprocessor {
                name: name.to_string(),
                description: description.to_string(),
                func: Arc::new(func),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Preprocessor> {
        self.entries.get(name)
    }

    /// Apply a spec sequence; unknown names are skipped.
    pub fn apply(
        &self,
        specs: &[PreprocessorSpec],
        project: &dyn ProjectContext,
        messages: Vec<Message>,
    ) -> Vec<Message> {
        let mut current = messages;
        for spec in specs {
            if let Some(preprocessor) = self.get(&spec.name) {
                current = (preprocessor.func)(project, spec, current);
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::testing::StubProject;

    #[test]
    fn apply_runs_registered_transforms_in_order() {
        let mut registry = PreprocessorRegistry::new();
        registry.register("shout", "uppercase system text", |_p, _s, mut msgs| {
            for m in msgs.iter_mut().filter(|m| m.role == Role::System) {
                m.text = m.text.to_uppercase();
            }
            msgs
        });

        let project = StubProject::new();
        let specs: Vec<PreprocessorSpec> =
            serde_json::from_value(serde_json::json!(["shout", "missing"])).unwrap();
        let out = registry.apply(
            &specs,
            &project,
            vec![Message::system("be brief"), Message::user("hi")],
        );
        assert_eq!(out[0].text, "BE BRIEF");
        assert_eq!(out[1].text, "hi");
    }
}
