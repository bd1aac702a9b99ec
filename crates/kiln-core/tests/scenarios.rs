use kiln_core::caching::DisabledReasonCategory;
use kiln_core::fingerprint::fingerprint_property;
use kiln_core::property::{Cardinality, FileSpec};
use kiln_core::schema::SchemaBuilder;
use kiln_core::task::TaskAction;
use kiln_core::visitor::{visit_fingerprint, VisitState};
use kiln_core::*;
use std::path::PathBuf;
use std::sync::Arc;

fn path(p: &str) -> TaskPath {
    TaskPath::parse(p).unwrap()
}

#[derive(Default)]
struct Events(Vec<String>);

impl InputFilePropertyVisitor for Events {
    fn pre_root(&mut self, state: &VisitState<'_>) {
        self.0.push(format!("preRoot {}", state.name));
    }
    fn pre_directory(&mut self, state: &VisitState<'_>) {
        self.0.push(format!("preDirectory {}", state.name));
    }
    fn file(&mut self, state: &VisitState<'_>) {
        self.0.push(format!("file {} {}", state.name, state.hash.short()));
    }
    fn post_directory(&mut self) {
        self.0.push("postDirectory".into());
    }
    fn post_root(&mut self) {
        self.0.push("postRoot".into());
    }
}

struct Compile {
    src: Option<PathBuf>,
}

impl Describe for Compile {
    fn describe(schema: &mut SchemaBuilder<Self>) {
        schema
            .input_file("src", |c| c.src.clone().map(FileValue::Path))
            .normalizer(Normalizer::RelativePath);
    }
}

#[test]
fn test_missing_required_runtime_input() {
    let mut task = Task::ad_hoc(path(":t"));
    task.inputs_mut()
        .unwrap()
        .file(None)
        .with_property_name("src")
        .normalizer(Normalizer::RelativePath);

    let props = walk_properties(&task, SchemaRegistry::global()).unwrap();
    let errors: Vec<_> = props.validation.errors().map(|d| d.message.as_str()).collect();
    assert_eq!(errors, vec!["No value has been specified for property 'src'."]);
    assert_eq!(props.validation.diagnostics().len(), 1);
}

#[test]
fn test_missing_required_declared_input() {
    let task = Task::new(
        path(":compile"),
        Arc::new(Compile { src: None }),
        Implementation::new("Compile", HashCode::of("app-loader")),
    );

    let props = walk_properties(&task, SchemaRegistry::global()).unwrap();
    let errors: Vec<_> = props.validation.errors().map(|d| d.message.as_str()).collect();
    assert_eq!(errors, vec!["No value has been specified for property 'src'."]);

    let err = props.validation.check(task.path().as_str()).unwrap_err();
    assert!(matches!(err, TaskError::Validation { ref messages, .. } if messages.len() == 1));
}

#[test]
fn test_mixed_notations_resolve_to_their_tasks() {
    let mut container = TaskContainer::default();
    for name in [":b", ":c", ":taskD"] {
        container.create(Task::ad_hoc(path(name))).unwrap();
    }
    let mut a = Task::ad_hoc(path(":a"));
    a.depends_on(path(":b")).unwrap();
    a.depends_on(DependencyNotation::lazy(|_| path(":c").into())).unwrap();
    a.depends_on("taskD").unwrap();
    container.create(a).unwrap();

    let a = container.get(&path(":a")).unwrap();
    let resolved = DependencyResolver::new(&container)
        .resolve(a, a.dependency(DependencyKind::DependsOn))
        .unwrap();
    let names: Vec<_> = resolved.iter().map(TaskPath::as_str).collect();
    assert_eq!(names, vec![":b", ":c", ":taskD"]);
}

#[test]
fn test_empty_directory_ignored() {
    let h1 = HashCode::of("a");
    let root = FileSystemLocationSnapshot::directory(
        "/w/root",
        vec![
            FileSystemLocationSnapshot::file("/w/root/a.txt", h1),
            FileSystemLocationSnapshot::directory("/w/root/empty", vec![]),
        ],
    );
    let mut spec = FileSpec::input(Cardinality::Directory);
    spec.normalizer = Normalizer::RelativePath;
    spec.directory_sensitivity = DirectorySensitivity::IgnoreDirectories;

    let fp = fingerprint_property("src", &spec, vec![root]);
    assert_eq!(fp.entries.len(), 1);
    assert_eq!(fp.entries[0].normalized_path, "a.txt");
    assert_eq!(fp.entries[0].content_hash, h1);

    let mut events = Events::default();
    visit_fingerprint(&fp, &mut events);
    assert_eq!(
        events.0,
        vec![
            "preRoot root".to_string(),
            format!("file a.txt {}", h1.short()),
            "postRoot".to_string(),
        ]
    );
}

#[test]
fn test_untracked_action_disables_caching_but_keeps_fingerprints() {
    let snapshotter = StaticSnapshotter::new()
        .with(FileSystemLocationSnapshot::file("/w/src.txt", HashCode::of("src")))
        .with(FileSystemLocationSnapshot::file("/w/out.txt", HashCode::of("out")));
    let ctx = BuildContext::new(KilnConfig::default(), Arc::new(snapshotter));

    let mut task = Task::ad_hoc(path(":script"));
    task.set_cacheable(true).unwrap();
    task.add_action(TaskAction::new("doLast", Implementation::untracked("BuildScript")))
        .unwrap();
    task.inputs_mut()
        .unwrap()
        .file(Some(FileValue::path("/w/src.txt")))
        .with_property_name("src");
    task.outputs_mut()
        .unwrap()
        .file(Some(FileValue::path("/w/out.txt")))
        .with_property_name("out");

    let analysis = ctx.analyze(&task).unwrap();
    let reasons: Vec<_> = analysis.caching.reasons().iter().map(|r| r.category).collect();
    assert_eq!(reasons, vec![DisabledReasonCategory::NonCacheableTaskAction]);

    let fingerprint = &analysis.state().input_file_fingerprints["src"];
    assert_eq!(fingerprint.entries.len(), 1);
    assert_eq!(fingerprint.entries[0].content_hash, HashCode::of("src"));
}
