use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use preupgrade_domain::{AnswerSet, AnswerValue, Dialog};
use serde::{Deserialize, Serialize};

const ANSWER_FILE_FORMAT_VERSION: u32 = 1;

/// Persists operator answers between runs.
pub trait AnswerFileStore {
    /// Answers from `answer_file` overlaid with `user_choices`. Missing files are empty.
    #[allow(clippy::missing_errors_doc)]
    fn load(&self, answer_file: &Path, user_choices: &Path) -> Result<AnswerSet>;

    #[allow(clippy::missing_errors_doc)]
    fn save(
        &self,
        answer_file: &Path,
        user_choices: &Path,
        answers: &AnswerSet,
        dialogs: &[Dialog],
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
struct AnswerFileDocument {
    format_version: u32,
    #[serde(default)]
    dialogs: BTreeMap<String, DialogSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
struct DialogSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(default)]
    answers: BTreeMap<String, AnswerValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    defaults: BTreeMap<String, AnswerValue>,
}

/// YAML answer file plus an operator-maintained user-choices file.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlAnswerFile;

impl YamlAnswerFile {
    fn read(path: &Path) -> Result<Option<AnswerFileDocument>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(Some(AnswerFileDocument::default()));
        }
        let document: AnswerFileDocument = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid answer file {}", path.display()))?;
        if document.format_version != ANSWER_FILE_FORMAT_VERSION {
            return Err(anyhow!(
                "unsupported answer file format_version {} in {}",
                document.format_version,
                path.display()
            ));
        }
        Ok(Some(document))
    }

    fn write(path: &Path, document: &AnswerFileDocument) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(document)?;
        fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
    }
}

fn answers_of(document: &AnswerFileDocument) -> AnswerSet {
    let mut answers = AnswerSet::default();
    for (scope, section) in &document.dialogs {
        for (key, value) in &section.answers {
            answers.insert(scope, key, value.clone());
        }
    }
    answers
}

impl AnswerFileStore for YamlAnswerFile {
    fn load(&self, answer_file: &Path, user_choices: &Path) -> Result<AnswerSet> {
        let mut answers = Self::read(answer_file)?
            .map(|document| answers_of(&document))
            .unwrap_or_default();
        if let Some(choices) = Self::read(user_choices)? {
            answers.overlay(&answers_of(&choices));
        }
        Ok(answers)
    }

    fn save(
        &self,
        answer_file: &Path,
        user_choices: &Path,
        answers: &AnswerSet,
        dialogs: &[Dialog],
    ) -> Result<()> {
        let mut document = AnswerFileDocument {
            format_version: ANSWER_FILE_FORMAT_VERSION,
            dialogs: BTreeMap::new(),
        };
        for (scope, values) in answers.scopes() {
            if values.is_empty() {
                continue;
            }
            document.dialogs.entry(scope.clone()).or_default().answers = values.clone();
        }
        for dialog in dialogs {
            let defaults: BTreeMap<String, AnswerValue> = dialog
                .components
                .iter()
                .filter(|component| answers.get(&dialog.scope, &component.key).is_none())
                .filter_map(|component| {
                    component
                        .default
                        .clone()
                        .map(|value| (component.key.clone(), value))
                })
                .collect();
            let section = document.dialogs.entry(dialog.scope.clone()).or_default();
            section.title = Some(dialog.title.clone());
            section.defaults = defaults;
        }
        Self::write(answer_file, &document)?;

        if let Some(mut choices) = Self::read(user_choices)? {
            let mut changed = false;
            for (scope, section) in &mut choices.dialogs {
                for (key, value) in &mut section.answers {
                    if let Some(current) = answers.get(scope, key) {
                        if current != value {
                            value.clone_from(current);
                            changed = true;
                        }
                    }
                }
            }
            if changed {
                Self::write(user_choices, &choices)?;
            }
        }
        Ok(())
    }
}
