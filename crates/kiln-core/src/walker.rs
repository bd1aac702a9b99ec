//! Property discovery
//!
//! Walks the task's bean breadth-first through its type schemas, then appends
//! the properties registered at runtime. Nested beans contribute their
//! properties under a dotted prefix.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::TaskError;
use crate::property::{Cardinality, FileSpec, FileValue, PropertyKind, PropertySpec};
use crate::schema::{Accessor, Bean, Marker, SchemaRegistry, Visibility};
use crate::task::{BoundValue, RuntimeProperty, Task};
use crate::validation::ValidationReport;
use crate::value::PropertyValue;

/// A discovered property with its current value
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProperty {
    pub spec: PropertySpec,
    pub value: BoundValue,
}

impl ResolvedProperty {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn value(&self) -> Option<&PropertyValue> {
        match &self.value {
            BoundValue::Value(value) => value.as_ref(),
            BoundValue::Files(_) => None,
        }
    }

    pub fn files(&self) -> Option<&FileValue> {
        match &self.value {
            BoundValue::Files(files) => files.as_ref(),
            BoundValue::Value(_) => None,
        }
    }
}

/// All properties of one task, each category sorted by name
#[derive(Debug, Clone, Default)]
pub struct TaskProperties {
    pub inputs: Vec<ResolvedProperty>,
    pub outputs: Vec<ResolvedProperty>,
    pub destroyables: Vec<ResolvedProperty>,
    pub local_state: Vec<ResolvedProperty>,
    pub validation: ValidationReport,
}

impl TaskProperties {
    pub fn input_values(&self) -> impl Iterator<Item = &ResolvedProperty> {
        self.inputs
            .iter()
            .filter(|p| matches!(p.spec.kind, PropertyKind::Value))
    }

    pub fn input_files(&self) -> impl Iterator<Item = &ResolvedProperty> {
        self.inputs
            .iter()
            .filter(|p| matches!(p.spec.kind, PropertyKind::File(_)))
    }

    pub fn has_declared_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Ordered spec list, for display and determinism checks
    pub fn specs(&self) -> Vec<&PropertySpec> {
        self.inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.destroyables)
            .chain(&self.local_state)
            .map(|p| &p.spec)
            .collect()
    }
}

/// Serializable overview of a task's properties
#[derive(Debug, Clone, Serialize)]
pub struct PropertySummary<'a> {
    pub inputs: Vec<&'a PropertySpec>,
    pub outputs: Vec<&'a PropertySpec>,
    pub destroyables: Vec<&'a PropertySpec>,
    pub local_state: Vec<&'a PropertySpec>,
}

impl<'a> From<&'a TaskProperties> for PropertySummary<'a> {
    fn from(properties: &'a TaskProperties) -> Self {
        let specs = |list: &'a [ResolvedProperty]| -> Vec<&'a PropertySpec> {
            list.iter().map(|p| &p.spec).collect()
        };
        Self {
            inputs: specs(&properties.inputs),
            outputs: specs(&properties.outputs),
            destroyables: specs(&properties.destroyables),
            local_state: specs(&properties.local_state),
        }
    }
}

#[derive(Default)]
struct Collector {
    inputs: Vec<ResolvedProperty>,
    outputs: Vec<ResolvedProperty>,
    destroyables: Vec<ResolvedProperty>,
    local_state: Vec<ResolvedProperty>,
    validation: ValidationReport,
}

fn qualified(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string(),
    }
}

fn read_files(accessor: &Accessor, bean: &dyn Bean) -> Option<FileValue> {
    match accessor {
        Accessor::Files(get) => get(bean.as_any()),
        _ => None,
    }
}

fn file_property(name: String, spec: FileSpec, optional: bool, value: Option<FileValue>) -> ResolvedProperty {
    let direction = spec.role;
    ResolvedProperty {
        spec: PropertySpec {
            name,
            direction,
            kind: PropertyKind::File(spec),
            optional,
        },
        value: BoundValue::Files(value),
    }
}

/// Discover every property of `task`
#[instrument(skip_all, fields(task = %task.path()))]
pub fn walk_properties(
    task: &Task,
    registry: &SchemaRegistry,
) -> Result<TaskProperties, TaskError> {
    let mut collector = Collector::default();
    let mut queue: VecDeque<(Option<String>, Arc<dyn Bean>)> = VecDeque::new();
    let mut seen = HashSet::new();
    // Walked beans stay alive so their addresses cannot be reused mid-walk
    let mut walked = Vec::new();
    queue.push_back((None, Arc::clone(task.bean())));

    while let Some((prefix, bean)) = queue.pop_front() {
        // A bean reachable twice is only walked the first time
        if !seen.insert(Arc::as_ptr(&bean) as *const () as usize) {
            continue;
        }
        walked.push(Arc::clone(&bean));
        let schema = bean.schema(registry);
        debug!(
            prefix = prefix.as_deref().unwrap_or(""),
            type_name = schema.type_name(),
            "walking bean"
        );

        for template in schema.templates() {
            let name = qualified(prefix.as_deref(), template.name());
            let optional = template.is_optional();
            match template.marker() {
                Marker::Input => {
                    let value = match template.accessor() {
                        Accessor::Value(get) => get(bean.as_any()),
                        _ => None,
                    };
                    collector.inputs.push(ResolvedProperty {
                        spec: PropertySpec::input_value(name).optional(optional),
                        value: BoundValue::Value(value),
                    });
                }
                Marker::InputFile(spec) => {
                    let value = read_files(template.accessor(), bean.as_ref());
                    collector
                        .inputs
                        .push(file_property(name, spec.clone(), optional, value));
                }
                Marker::OutputFile(cardinality) => {
                    let value = read_files(template.accessor(), bean.as_ref());
                    collector.outputs.push(file_property(
                        name,
                        FileSpec::output(*cardinality),
                        optional,
                        value,
                    ));
                }
                Marker::Destroys | Marker::LocalState => {
                    let value = read_files(template.accessor(), bean.as_ref());
                    let property = file_property(
                        name,
                        FileSpec::output(Cardinality::FileCollection),
                        true,
                        value,
                    );
                    if matches!(template.marker(), Marker::Destroys) {
                        collector.destroyables.push(property);
                    } else {
                        collector.local_state.push(property);
                    }
                }
                Marker::Nested => {
                    let nested = match template.accessor() {
                        Accessor::Nested(get) => get(bean.as_any()),
                        _ => Ok(None),
                    };
                    match nested {
                        Ok(Some(child)) => queue.push_back((Some(name), child)),
                        Ok(None) if !optional => collector.validation.missing_value(&name),
                        Ok(None) => {}
                        Err(err) => collector
                            .validation
                            .warning(format!("Property '{}' could not be read: {}", name, err)),
                    }
                }
                Marker::Ignored(_) => {}
                Marker::Unrecognized(_) => {
                    if template.visibility() == Visibility::Public {
                        collector.validation.warning(format!(
                            "Property '{}' is not annotated with an input or output annotation.",
                            name
                        ));
                    }
                }
            }
        }
    }

    let task_name = task.path().to_string();
    add_runtime(&task_name, &mut collector.inputs, task.inputs().entries())?;
    add_runtime(&task_name, &mut collector.outputs, task.outputs().entries())?;
    add_runtime(
        &task_name,
        &mut collector.destroyables,
        task.destroyables().entries(),
    )?;
    add_runtime(
        &task_name,
        &mut collector.local_state,
        task.local_state().entries(),
    )?;

    for property in collector.inputs.iter().chain(&collector.outputs) {
        if !property.spec.optional && !property.value.is_present() {
            collector.validation.missing_value(property.name());
        }
    }

    let properties = TaskProperties {
        inputs: finish(&task_name, "input", collector.inputs)?,
        outputs: finish(&task_name, "output", collector.outputs)?,
        destroyables: finish(&task_name, "destroyable", collector.destroyables)?,
        local_state: finish(&task_name, "local state", collector.local_state)?,
        validation: collector.validation,
    };

    debug!(
        inputs = properties.inputs.len(),
        outputs = properties.outputs.len(),
        diagnostics = properties.validation.diagnostics().len(),
        "properties discovered"
    );
    Ok(properties)
}

/// Append runtime registrations, naming unnamed ones `$1`, `$2`, ...
fn add_runtime(
    task: &str,
    target: &mut Vec<ResolvedProperty>,
    entries: &[RuntimeProperty],
) -> Result<(), TaskError> {
    let mut synthetic = 0;
    for entry in entries {
        let name = match &entry.name {
            Some(name) if name.is_empty() => {
                return Err(TaskError::InvalidPropertyName {
                    task: task.to_string(),
                    name: name.clone(),
                    reason: "property names must not be empty",
                })
            }
            Some(name) if name.starts_with('$') => {
                return Err(TaskError::InvalidPropertyName {
                    task: task.to_string(),
                    name: name.clone(),
                    reason: "names starting with '$' are reserved",
                })
            }
            Some(name) => name.clone(),
            None => {
                synthetic += 1;
                format!("${}", synthetic)
            }
        };
        let property = match (&entry.file_spec, &entry.value) {
            (Some(spec), BoundValue::Files(value)) => {
                file_property(name, spec.clone(), entry.optional, value.clone())
            }
            (_, value) => ResolvedProperty {
                spec: PropertySpec::input_value(name).optional(entry.optional),
                value: value.clone(),
            },
        };
        target.push(property);
    }
    Ok(())
}

/// Sort by name and reject duplicates within one category
fn finish(
    task: &str,
    category: &'static str,
    mut properties: Vec<ResolvedProperty>,
) -> Result<Vec<ResolvedProperty>, TaskError> {
    properties.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
    if let Some(pair) = properties.windows(2).find(|w| w[0].spec.name == w[1].spec.name) {
        return Err(TaskError::DuplicateProperty {
            task: task.to_string(),
            category,
            name: pair[0].spec.name.clone(),
        });
    }
    Ok(properties)
}
