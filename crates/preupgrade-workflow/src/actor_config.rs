use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

use crate::actor::ActorMetadata;
use crate::repository::ActorRepository;

/// Read every `*.yaml` file in `dir` (sorted by name) into one
/// `{section: {name: value}}` object. Later files override earlier keys.
/// A missing directory yields an empty object.
///
/// # Errors
/// Returns an error when a file cannot be read or is not a mapping of mappings.
pub fn load_actor_config_overrides(dir: &Path) -> Result<Value> {
    let mut merged = Map::new();
    if !dir.is_dir() {
        return Ok(Value::Object(merged));
    }
    let mut paths: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("failed to list actor config dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    paths.sort();

    for path in paths {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read actor config {}", path.display()))?;
        let value: Value = serde_yaml::from_str(&content)
            .with_context(|| format!("invalid actor config YAML in {}", path.display()))?;
        let sections = match value {
            Value::Object(sections) => sections,
            Value::Null => continue,
            _ => return Err(anyhow!("{} must contain a mapping of sections", path.display())),
        };
        for (section, values) in sections {
            let Value::Object(values) = values else {
                return Err(anyhow!(
                    "section {section} in {} must be a mapping",
                    path.display()
                ));
            };
            let target = merged
                .entry(section)
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(target) = target {
                target.extend(values);
            }
        }
    }
    Ok(Value::Object(merged))
}

/// Combine persisted overrides with every actor's declared defaults.
///
/// Overrides for fields no actor declares are dropped with a warning.
#[must_use]
pub fn merge_actor_config(repository: &ActorRepository, overrides: &Value) -> Value {
    let mut merged = Map::new();
    for actor in repository.actors() {
        for field in &actor.metadata().config_schema {
            let value = overrides
                .get(&field.section)
                .and_then(|section| section.get(&field.name))
                .cloned()
                .unwrap_or_else(|| field.default.clone());
            if let Value::Object(section) = merged
                .entry(field.section.clone())
                .or_insert_with(|| Value::Object(Map::new()))
            {
                section.insert(field.name.clone(), value);
            }
        }
    }

    if let Value::Object(sections) = overrides {
        for (section, values) in sections {
            let Value::Object(values) = values else {
                continue;
            };
            for name in values.keys() {
                let declared = merged
                    .get(section)
                    .is_some_and(|known| known.get(name).is_some());
                if !declared {
                    tracing::warn!(section = %section, name = %name, "ignoring undeclared actor config value");
                }
            }
        }
    }
    Value::Object(merged)
}

/// The slice of the run-scoped actor configuration an actor declared.
#[must_use]
pub fn actor_view(metadata: &ActorMetadata, all: &Value) -> Value {
    let mut view = Map::new();
    for field in &metadata.config_schema {
        let value = all
            .get(&field.section)
            .and_then(|section| section.get(&field.name))
            .cloned()
            .unwrap_or_else(|| field.default.clone());
        if let Value::Object(section) = view
            .entry(field.section.clone())
            .or_insert_with(|| Value::Object(Map::new()))
        {
            section.insert(field.name.clone(), value);
        }
    }
    Value::Object(view)
}
