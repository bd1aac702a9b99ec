//! Type schemas - declared property markers per concrete type
//!
//! A type describes its properties once through [`Describe`]; the resulting
//! [`TypeSchema`] is cached per `TypeId` in a [`SchemaRegistry`]. Instance
//! values are read through the accessors stored in each template, so no
//! runtime reflection is involved.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::property::{
    Cardinality, DirectorySensitivity, FileSpec, FileValue, LineEndingSensitivity, Normalizer,
};
use crate::value::PropertyValue;

/// Implemented by task types and nested beans to declare their properties
pub trait Describe: Send + Sync + 'static {
    fn describe(schema: &mut SchemaBuilder<Self>)
    where
        Self: Sized;
}

/// Object-safe view of a described instance
pub trait Bean: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;

    fn schema(&self, registry: &SchemaRegistry) -> Arc<TypeSchema>;
}

impl<T: Describe> Bean for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn schema(&self, registry: &SchemaRegistry) -> Arc<TypeSchema> {
        registry.schema_for::<T>()
    }
}

/// Failure while reading a nested bean from its owner
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BeanReadError(pub String);

/// What a property template declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Input,
    InputFile(FileSpec),
    OutputFile(Cardinality),
    Destroys,
    LocalState,
    Nested,
    /// Recognized marker that contributes nothing (internal, console)
    Ignored(&'static str),
    /// No marker, or one without a handler
    Unrecognized(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

type ValueGetter = Box<dyn Fn(&dyn Any) -> Option<PropertyValue> + Send + Sync>;
type FileGetter = Box<dyn Fn(&dyn Any) -> Option<FileValue> + Send + Sync>;
type NestedGetter =
    Box<dyn Fn(&dyn Any) -> Result<Option<Arc<dyn Bean>>, BeanReadError> + Send + Sync>;

pub(crate) enum Accessor {
    Value(ValueGetter),
    Files(FileGetter),
    Nested(NestedGetter),
    None,
}

/// One declared property of a type, with its instance accessor
pub struct PropertyTemplate {
    name: String,
    marker: Marker,
    optional: bool,
    visibility: Visibility,
    accessor: Accessor,
}

impl PropertyTemplate {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn marker(&self) -> &Marker {
        &self.marker
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub(crate) fn accessor(&self) -> &Accessor {
        &self.accessor
    }

    pub fn optional(&mut self) -> &mut Self {
        self.optional = true;
        self
    }

    pub fn private(&mut self) -> &mut Self {
        self.visibility = Visibility::Private;
        self
    }

    pub fn normalizer(&mut self, normalizer: Normalizer) -> &mut Self {
        if let Marker::InputFile(spec) = &mut self.marker {
            spec.normalizer = normalizer;
        }
        self
    }

    pub fn directory_sensitivity(&mut self, sensitivity: DirectorySensitivity) -> &mut Self {
        if let Marker::InputFile(spec) = &mut self.marker {
            spec.directory_sensitivity = sensitivity;
        }
        self
    }

    pub fn line_endings(&mut self, sensitivity: LineEndingSensitivity) -> &mut Self {
        if let Marker::InputFile(spec) = &mut self.marker {
            spec.line_ending_sensitivity = sensitivity;
        }
        self
    }

    pub fn skip_when_empty(&mut self) -> &mut Self {
        if let Marker::InputFile(spec) = &mut self.marker {
            spec.skip_when_empty = true;
        }
        self
    }
}

impl fmt::Debug for PropertyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyTemplate")
            .field("name", &self.name)
            .field("marker", &self.marker)
            .field("optional", &self.optional)
            .field("visibility", &self.visibility)
            .finish()
    }
}

/// Collects the templates of one type during [`Describe::describe`]
pub struct SchemaBuilder<T> {
    templates: Vec<PropertyTemplate>,
    _type: PhantomData<fn(&T)>,
}

impl<T: 'static> SchemaBuilder<T> {
    fn new() -> Self {
        Self {
            templates: Vec::new(),
            _type: PhantomData,
        }
    }

    fn push(&mut self, name: &str, marker: Marker, accessor: Accessor) -> &mut PropertyTemplate {
        self.templates.push(PropertyTemplate {
            name: name.to_string(),
            marker,
            optional: false,
            visibility: Visibility::Public,
            accessor,
        });
        let last = self.templates.len() - 1;
        &mut self.templates[last]
    }

    fn value_getter<F>(get: F) -> Accessor
    where
        F: Fn(&T) -> Option<PropertyValue> + Send + Sync + 'static,
    {
        Accessor::Value(Box::new(move |any| any.downcast_ref::<T>().and_then(&get)))
    }

    fn file_getter<F>(get: F) -> Accessor
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        Accessor::Files(Box::new(move |any| any.downcast_ref::<T>().and_then(&get)))
    }

    pub fn input<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<PropertyValue> + Send + Sync + 'static,
    {
        self.push(name, Marker::Input, Self::value_getter(get))
    }

    pub fn input_file<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        let marker = Marker::InputFile(FileSpec::input(Cardinality::File));
        self.push(name, marker, Self::file_getter(get))
    }

    pub fn input_directory<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        let marker = Marker::InputFile(FileSpec::input(Cardinality::Directory));
        self.push(name, marker, Self::file_getter(get))
    }

    pub fn input_files<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        let marker = Marker::InputFile(FileSpec::input(Cardinality::FileCollection));
        self.push(name, marker, Self::file_getter(get))
    }

    pub fn output_file<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        self.push(
            name,
            Marker::OutputFile(Cardinality::File),
            Self::file_getter(get),
        )
    }

    pub fn output_directory<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        self.push(
            name,
            Marker::OutputFile(Cardinality::Directory),
            Self::file_getter(get),
        )
    }

    pub fn output_files<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        self.push(
            name,
            Marker::OutputFile(Cardinality::FileCollection),
            Self::file_getter(get),
        )
    }

    pub fn destroys<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        self.push(name, Marker::Destroys, Self::file_getter(get))
    }

    pub fn local_state<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Option<FileValue> + Send + Sync + 'static,
    {
        self.push(name, Marker::LocalState, Self::file_getter(get))
    }

    /// A property whose value is itself a described bean, walked with
    /// `name` as a dotted prefix
    pub fn nested<F>(&mut self, name: &str, get: F) -> &mut PropertyTemplate
    where
        F: Fn(&T) -> Result<Option<Arc<dyn Bean>>, BeanReadError> + Send + Sync + 'static,
    {
        let accessor = Accessor::Nested(Box::new(move |any| match any.downcast_ref::<T>() {
            Some(owner) => get(owner),
            None => Ok(None),
        }));
        self.push(name, Marker::Nested, accessor)
    }

    pub fn internal(&mut self, name: &str) -> &mut PropertyTemplate {
        self.push(name, Marker::Ignored("internal"), Accessor::None)
    }

    pub fn console(&mut self, name: &str) -> &mut PropertyTemplate {
        self.push(name, Marker::Ignored("console"), Accessor::None)
    }

    /// A property carrying no marker at all
    pub fn unannotated(&mut self, name: &str) -> &mut PropertyTemplate {
        self.push(name, Marker::Unrecognized(None), Accessor::None)
    }

    /// A property carrying a marker no handler knows about
    pub fn custom(&mut self, name: &str, marker: &str) -> &mut PropertyTemplate {
        self.push(
            name,
            Marker::Unrecognized(Some(marker.to_string())),
            Accessor::None,
        )
    }
}

/// Cached property templates of one concrete type, sorted by name
#[derive(Debug)]
pub struct TypeSchema {
    type_name: &'static str,
    templates: Vec<PropertyTemplate>,
}

impl TypeSchema {
    fn build<T: Describe>() -> Self {
        let mut builder = SchemaBuilder::<T>::new();
        T::describe(&mut builder);
        let mut templates = builder.templates;
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            type_name: type_name::<T>(),
            templates,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn templates(&self) -> &[PropertyTemplate] {
        &self.templates
    }
}

/// Read-mostly cache of type schemas.
///
/// Safe for concurrent population: a schema may be built twice by racing
/// threads, but only the first insert is kept and every caller sees it.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<TypeId, Arc<TypeSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static SchemaRegistry {
        static GLOBAL: OnceLock<SchemaRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SchemaRegistry::new)
    }

    pub fn schema_for<T: Describe>(&self) -> Arc<TypeSchema> {
        let id = TypeId::of::<T>();
        if let Some(schema) = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Arc::clone(schema);
        }

        let built = Arc::new(TypeSchema::build::<T>());
        debug!(
            type_name = built.type_name(),
            properties = built.templates().len(),
            "type schema built"
        );

        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(schemas.entry(id).or_insert(built))
    }

    pub fn len(&self) -> usize {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DESCRIBE_CALLS: AtomicUsize = AtomicUsize::new(0);

    struct Counted;

    impl Describe for Counted {
        fn describe(_schema: &mut SchemaBuilder<Self>) {
            DESCRIBE_CALLS.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Compile {
        source: PathBuf,
        release: i64,
    }

    impl Describe for Compile {
        fn describe(schema: &mut SchemaBuilder<Self>) {
            schema
                .input_directory("source", |c| Some(FileValue::path(&c.source)))
                .normalizer(Normalizer::RelativePath)
                .skip_when_empty();
            schema.input("release", |c| Some(PropertyValue::from(c.release)));
            schema.internal("logger");
            schema.custom("extra", "Experimental").private();
        }
    }

    #[test]
    fn test_templates_sorted_by_name() {
        let registry = SchemaRegistry::new();
        let schema = registry.schema_for::<Compile>();
        let names: Vec<_> = schema.templates().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["extra", "logger", "release", "source"]);
    }

    #[test]
    fn test_modifiers_applied() {
        let registry = SchemaRegistry::new();
        let schema = registry.schema_for::<Compile>();
        let source = schema
            .templates()
            .iter()
            .find(|t| t.name() == "source")
            .unwrap();
        match source.marker() {
            Marker::InputFile(spec) => {
                assert_eq!(spec.normalizer, Normalizer::RelativePath);
                assert_eq!(spec.cardinality, Cardinality::Directory);
                assert!(spec.skip_when_empty);
            }
            other => panic!("unexpected marker {:?}", other),
        }
        let extra = schema
            .templates()
            .iter()
            .find(|t| t.name() == "extra")
            .unwrap();
        assert_eq!(extra.visibility(), Visibility::Private);
    }

    #[test]
    fn test_accessors_read_instance() {
        let registry = SchemaRegistry::new();
        let task = Compile {
            source: PathBuf::from("/src"),
            release: 17,
        };
        let schema = Bean::schema(&task, &registry);
        let release = schema
            .templates()
            .iter()
            .find(|t| t.name() == "release")
            .unwrap();
        match release.accessor() {
            Accessor::Value(get) => assert_eq!(get(task.as_any()), Some(PropertyValue::Int(17))),
            _ => panic!("expected value accessor"),
        }
    }

    #[test]
    fn test_schema_built_once_per_type() {
        let registry = Arc::new(SchemaRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.schema_for::<Counted>())
            })
            .collect();
        let schemas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(schemas.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        // Racing threads may build twice, but the cached schema is reused afterwards
        let before = DESCRIBE_CALLS.load(Ordering::SeqCst);
        registry.schema_for::<Counted>();
        assert_eq!(DESCRIBE_CALLS.load(Ordering::SeqCst), before);
    }
}
