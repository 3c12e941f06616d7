// tests/cook_and_commit.rs

//! Full build-to-repository flow: cook a small recipe, run the policy
//! pipeline over the destdir, commit the resulting component, and read the
//! stored streams back.

use cookery::db::Database;
use cookery::flavor::Flavor;
use cookery::policy::{Pipeline, PolicyContext, PolicyExceptions};
use cookery::recipe::{BuildRunner, Recipe, RunnerConfig};
use cookery::repository::{accessmap, auth, schema, troves, Committer, FileEntry, TroveCommit};
use cookery::version::Version;
use std::collections::BTreeMap;

const SERVER: &str = "repo.example.com";
const V1: &str = "/repo.example.com@cook:devel/1.0-1-1";

fn repository() -> Database {
    let db = Database::open_in_memory().unwrap();
    schema::setup(&db).unwrap();
    db
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_cook_pipeline_commit_retrieve() {
    init_tracing();
    let mut recipe = Recipe::new("hello", "1.0").unwrap();
    recipe
        .create("%(bindir)s/hello", "#!/bin/sh\necho hello\n", 0o755)
        .unwrap();
    recipe
        .create(
            "%(mandir)s/man1/hello.1",
            ".TH HELLO 1\nhello prints a greeting\n",
            0o644,
        )
        .unwrap();

    let runner = BuildRunner::new(&mut recipe, RunnerConfig::default()).unwrap();
    let (result, root) = runner.run().unwrap();
    let destdir = root.path().join("destdir");

    let files_before = result.manifest.len();
    assert_eq!(files_before, 2);

    let macros = recipe.macros.copy(true);
    let exceptions = PolicyExceptions::new();
    let mut ctx = PolicyContext::new(
        &destdir,
        &macros,
        result.manifest,
        &recipe.explicit_manifest,
        "hello",
        &recipe.build_requires,
        &exceptions,
    );
    Pipeline::standard().run(&mut ctx).unwrap();

    // Conservation: nothing here is removable, so every input file survives
    // (the man page under a new name) and carries exactly one attribution.
    assert_eq!(ctx.manifest.len(), files_before);
    assert!(ctx.assignments.contains_key("/usr/bin/hello"));
    assert!(ctx.assignments.contains_key("/usr/share/man/man1/hello.1.gz"));
    for path in ctx.manifest.keys() {
        assert!(ctx.assignments.contains_key(path), "unattributed {path}");
    }
    assert_eq!(
        ctx.assignments["/usr/bin/hello"],
        ("hello".to_string(), "runtime".to_string())
    );
    assert_eq!(
        ctx.assignments["/usr/share/man/man1/hello.1.gz"],
        ("hello".to_string(), "doc".to_string())
    );

    // Commit the runtime component with the staged bytes.
    let mut db = repository();
    auth::add_role(db.conn(), "builders").unwrap();
    accessmap::add_permission(db.conn(), "builders", None, None, true, false).unwrap();
    let roles = vec!["builders".to_string()];

    let version = Version::parse(V1).unwrap();
    let mut component = TroveCommit::new("hello:runtime", version.clone(), Flavor::empty());
    let mut streams: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (path, (_, comp)) in &ctx.assignments {
        if comp != "runtime" {
            continue;
        }
        let bytes = std::fs::read(destdir.join(path.trim_start_matches('/'))).unwrap();
        component.files.push(FileEntry {
            path: path.clone(),
            path_id: path.as_bytes().to_vec(),
            file_id: format!("id:{path}").into_bytes(),
            stream: Some(bytes.clone()),
        });
        streams.insert(path.clone(), bytes);
    }
    let mut package = TroveCommit::new("hello", version.clone(), Flavor::empty());
    package
        .includes
        .push(("hello:runtime".to_string(), version, Flavor::empty()));

    let committer = Committer::new([SERVER]);
    let ids = committer
        .commit(&mut db, &roles, &[component, package])
        .unwrap();
    assert_eq!(ids.len(), 2);

    // Stored streams come back byte for byte.
    for (path, bytes) in &streams {
        let stored = troves::file_stream(
            db.conn(),
            path.as_bytes(),
            format!("id:{path}").as_bytes(),
        )
        .unwrap();
        assert_eq!(&stored, bytes);
    }

    // The committing role sees both troves; write bit follows the grant.
    assert_eq!(
        accessmap::batch_check(db.conn(), &roles, &ids).unwrap(),
        vec![(true, true), (true, true)]
    );
    assert_eq!(
        troves::included_instances(db.conn(), ids[1]).unwrap(),
        vec![ids[0]]
    );
}

#[test]
fn test_man_page_normalization_idempotent() {
    let mut recipe = Recipe::new("manful", "1.0").unwrap();
    recipe
        .create("%(mandir)s/man5/manful.5", ".TH MANFUL 5\ncontent\n", 0o644)
        .unwrap();
    let runner = BuildRunner::new(&mut recipe, RunnerConfig::default()).unwrap();
    let (result, root) = runner.run().unwrap();
    let destdir = root.path().join("destdir");

    let macros = recipe.macros.copy(true);
    let exceptions = PolicyExceptions::new();
    let mut ctx = PolicyContext::new(
        &destdir,
        &macros,
        result.manifest,
        &recipe.explicit_manifest,
        "manful",
        &recipe.build_requires,
        &exceptions,
    );
    Pipeline::standard().run(&mut ctx).unwrap();
    let page = destdir.join("usr/share/man/man5/manful.5.gz");
    let first = std::fs::read(&page).unwrap();

    // A second run sees an already-normalized tree and changes nothing.
    let manifest = ctx.manifest.clone();
    let mut ctx = PolicyContext::new(
        &destdir,
        &macros,
        manifest,
        &recipe.explicit_manifest,
        "manful",
        &recipe.build_requires,
        &exceptions,
    );
    Pipeline::standard().run(&mut ctx).unwrap();
    assert_eq!(std::fs::read(&page).unwrap(), first);
}
