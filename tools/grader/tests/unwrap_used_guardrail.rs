use std::fs;
use std::path::{Path, PathBuf};

/// In-memory doubles may panic on a poisoned lock; nothing else may.
const EXPECT_ALLOWED: &[&str] = &["report.rs", "runtime/mod.rs", "runtime/scripted.rs"];

fn collect_rust_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}

/// Everything above the first test module.
fn production_part(source: &str) -> String {
    source
        .lines()
        .take_while(|line| !(line.trim_start().starts_with("#[cfg(") && line.contains("test")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn production_sources_propagate_errors_instead_of_unwrapping() {
    let src_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);
    files.sort();
    assert!(!files.is_empty());

    let mut offenders = Vec::new();
    for file in files {
        let relative = file
            .strip_prefix(&src_root)
            .expect("strip prefix")
            .to_string_lossy()
            .replace('\\', "/");
        let source = fs::read_to_string(&file).expect("read source");
        for (index, line) in production_part(&source).lines().enumerate() {
            let code = line.split("//").next().unwrap_or_default();
            let expect_call = code.contains(".expect(") && !EXPECT_ALLOWED.contains(&relative.as_str());
            if code.contains(".unwrap()") || expect_call {
                offenders.push(format!("{relative}:{}: {}", index + 1, line.trim()));
            }
        }
    }

    assert!(offenders.is_empty(), "panicking calls in production code:\n{}", offenders.join("\n"));
}
