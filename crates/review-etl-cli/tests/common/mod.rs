use std::path::{Path, PathBuf};

use assert_cmd::Command;

type TestResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Three products; one row without a rating and one duplicate key.
pub const SAMPLE_CSV: &str = "\
review_id,product_id,product_name,customer_id,review_date,rating,review_text
r1,P1,wireless mouse,c1,2024-01-01,5,great mouse
r2,P1,wireless mouse,c2,2024-01-02,,no rating given
r3,P1,wireless mouse,c3,2024-01-03,4,good value
r4,P2,usb hub,c1,2024-01-01,2,bad ports
r5,P2,usb hub,c4,2024-01-01,3,ok after all
r6,P3,desk lamp,c5,2024-01-04,4,nice light
";

pub fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("review-etl"))
}

pub fn write_input(dir: &Path, name: &str, contents: &str) -> TestResult<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

pub fn store_root(tmp: &tempfile::TempDir) -> PathBuf {
    tmp.path().join("store")
}

pub fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
