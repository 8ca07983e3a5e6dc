//! End-to-end: index a small tree on disk, plan regexes down to
//! candidate files, and grep the candidates, exercising only the
//! public API the front ends use.

use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use tgx::{merge, regexp_query, Grep, Index, IndexWriter, Matcher, Path, Version};

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    index: PathBuf,
}

fn write_tree(root: &PathBuf, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}

fn build_fixture(files: &[(&str, &str)]) -> Result<Fixture> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("tree");
    fs::create_dir_all(&root)?;
    write_tree(&root, files);

    let index = dir.path().join("csearchindex");
    let mut w = IndexWriter::create(&index, Version::V2)?;
    w.add_roots([Path::new(root.to_str().unwrap())]);
    let mut names: Vec<String> = files
        .iter()
        .map(|(name, _)| root.join(name).to_str().unwrap().to_string())
        .collect();
    names.sort_by(|a, b| Path::new(a).compare(&Path::new(b)));
    for name in &names {
        w.add_file(name)?;
    }
    w.flush()?;
    Ok(Fixture {
        _dir: dir,
        root,
        index,
    })
}

const TREE: &[(&str, &str)] = &[
    (
        "src/main.rs",
        "fn main() {\n    println!(\"Hello, world!\");\n    let total = add(40, 2);\n}\n",
    ),
    (
        "src/lib.rs",
        "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n\npub fn sub(a: i32, b: i32) -> i32 {\n    a - b\n}\n",
    ),
    (
        "docs/notes.md",
        "# Notes\n\nThe add function uses saturating arithmetic. TODO: check overflow.\n",
    ),
];

/// Plan, query, and grep; return (file name suffix, line number, line).
fn search(fx: &Fixture, pattern: &str) -> Result<Vec<(String, u64, String)>> {
    let hir = regex_syntax::parse(pattern).expect("parse");
    let ix = Index::open(&fx.index)?;
    let candidates = ix.posting_query(&regexp_query(&hir))?;

    let mut m = Matcher::new(&hir)?;
    let mut g = Grep::new();
    g.need_lineno = true;
    let mut out = Vec::new();
    for fileid in candidates {
        let name = ix.name(fileid)?.to_string();
        g.file(&mut m, &name, &mut |rec| {
            let suffix = rec
                .name
                .strip_prefix(&format!("{}/", fx.root.display()))
                .unwrap_or(&rec.name)
                .to_string();
            out.push((
                suffix,
                rec.lineno,
                String::from_utf8_lossy(&rec.line).into_owned(),
            ));
        })?;
    }
    Ok(out)
}

#[test]
fn literal_search() -> Result<()> {
    let fx = build_fixture(TREE)?;
    let hits = search(&fx, "saturating")?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "docs/notes.md");
    assert_eq!(hits[0].1, 3);
    Ok(())
}

#[test]
fn regex_search_narrows_candidates() -> Result<()> {
    let fx = build_fixture(TREE)?;

    let hir = regex_syntax::parse(r"pub fn \w+").expect("parse");
    let ix = Index::open(&fx.index)?;
    let q = regexp_query(&hir);
    let candidates = ix.posting_query(&q)?;
    // "pub fn " trigrams only occur in lib.rs
    assert_eq!(candidates.len(), 1);
    assert_eq!(
        ix.name(candidates[0])?.to_string(),
        fx.root.join("src/lib.rs").to_str().unwrap()
    );

    let hits = search(&fx, r"pub fn \w+")?;
    let lines: Vec<&str> = hits.iter().map(|(_, _, l)| l.as_str()).collect();
    assert_eq!(
        lines,
        vec![
            "pub fn add(a: i32, b: i32) -> i32 {",
            "pub fn sub(a: i32, b: i32) -> i32 {"
        ]
    );
    Ok(())
}

#[test]
fn dotstar_spans_within_a_line() -> Result<()> {
    let fx = build_fixture(TREE)?;
    let hits = search(&fx, "add.*arithmetic")?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "docs/notes.md");
    Ok(())
}

#[test]
fn no_match_reports_nothing() -> Result<()> {
    let fx = build_fixture(TREE)?;
    assert!(search(&fx, "no_such_identifier_anywhere")?.is_empty());
    Ok(())
}

#[test]
fn incremental_update_via_merge() -> Result<()> {
    let fx = build_fixture(TREE)?;

    // re-index one subtree with changed content
    let changed_root = fx.root.join("src");
    fs::write(
        changed_root.join("main.rs"),
        "fn main() {\n    renamed_function();\n}\n",
    )?;
    let small = fx.index.with_extension("new");
    let mut w = IndexWriter::create(&small, Version::V2)?;
    w.add_roots([Path::new(changed_root.to_str().unwrap())]);
    let mut names: Vec<String> = ["main.rs", "lib.rs"]
        .iter()
        .map(|n| changed_root.join(n).to_str().unwrap().to_string())
        .collect();
    names.sort_by(|a, b| Path::new(a).compare(&Path::new(b)));
    for name in &names {
        w.add_file(name)?;
    }
    w.flush()?;

    // merge and swap in, as a front end would
    let merged = fx.index.with_extension("merged");
    merge(&merged, &fx.index, &small, Version::V2)?;
    fs::rename(&merged, &fx.index)?;

    let ix = Index::open(&fx.index)?;
    ix.check()?;

    let hits = search(&fx, "renamed_function")?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "src/main.rs");

    // stale content is gone; untouched files survive
    assert!(search(&fx, "Hello, world")?.is_empty());
    assert_eq!(search(&fx, "saturating")?.len(), 1);
    Ok(())
}

#[test]
fn planner_and_matcher_agree_on_corpus() -> Result<()> {
    // Any line the matcher finds must come from a file the planner
    // kept: grep over all files equals grep over the candidates.
    let fx = build_fixture(TREE)?;
    let ix = Index::open(&fx.index)?;

    for pattern in ["add", "a.d", "fn (main|add)", "i3[0-9]", "TODO.*overflow"] {
        let hir = regex_syntax::parse(pattern).expect("parse");
        let candidates = ix.posting_query(&regexp_query(&hir))?;

        let mut m = Matcher::new(&hir)?;
        let mut g = Grep::new();
        let mut full = Vec::new();
        for id in 0..ix.num_name() as u32 {
            let name = ix.name(id)?.to_string();
            g.file(&mut m, &name, &mut |rec| full.push((rec.name, rec.line)))?;
        }
        for (name, _) in &full {
            let id = (0..ix.num_name() as u32)
                .find(|&i| ix.name(i).unwrap().to_string() == *name)
                .unwrap();
            assert!(
                candidates.contains(&id),
                "pattern {:?}: match in {:?} but file not in candidates",
                pattern,
                name
            );
        }
    }
    Ok(())
}
