use std::fs;

use camino::Utf8PathBuf;
use chrono::NaiveDate;

use paper_harvest::domain::{PaperId, PaperRecord};
use paper_harvest::layout::{Layout, PaperInfo};

fn layout() -> (tempfile::TempDir, Layout) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("papers")).unwrap();
    (temp, Layout::new(root))
}

fn paper(id: &str, published: NaiveDate) -> PaperRecord {
    PaperRecord {
        id: id.parse().unwrap(),
        title: format!("Title {id}"),
        authors: vec!["C. Shannon".to_string()],
        summary: "Information.".to_string(),
        categories: vec!["cs.IT".to_string()],
        pdf_url: format!("https://arxiv.org/pdf/{id}"),
        published,
        updated: None,
        comment: Some("12 pages".to_string()),
        doi: None,
        pdf_size: None,
    }
}

#[test]
fn layout_paths() {
    let layout = Layout::new(Utf8PathBuf::from("/data/papers"));
    let id: PaperId = "cond-mat/0102536v1".parse().unwrap();
    let date = NaiveDate::from_ymd_opt(2001, 2, 28).unwrap();

    assert_eq!(
        layout.pdf_path(&id, date),
        Utf8PathBuf::from("/data/papers/pdfs/2001-02-28/cond-mat_0102536v1.pdf")
    );
    assert_eq!(
        layout.info_path(&id, date),
        Utf8PathBuf::from("/data/papers/info/2001-02-28/cond-mat_0102536v1.json")
    );
    assert!(layout.partial_path(&id).starts_with(layout.partial_dir()));
}

#[test]
fn ensure_root_creates_tree() {
    let (_temp, layout) = layout();
    layout.ensure_root().unwrap();
    for dir in ["pdfs", "info", ".partial"] {
        assert!(layout.root().join(dir).as_std_path().is_dir());
    }
    // The writability probe leaves nothing behind.
    assert_eq!(fs::read_dir(layout.partial_dir().as_std_path()).unwrap().count(), 0);
}

#[test]
fn promote_moves_partial_and_control_file() {
    let (_temp, layout) = layout();
    layout.ensure_root().unwrap();
    let id: PaperId = "2407.00001".parse().unwrap();
    let date = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
    let partial = layout.partial_path(&id);
    fs::write(partial.as_std_path(), b"%PDF-1.6 body").unwrap();
    let control = format!("{partial}.aria2");
    fs::write(&control, b"state").unwrap();

    let target = layout.pdf_path(&id, date);
    layout.promote(&partial, &target).unwrap();

    assert_eq!(fs::read(target.as_std_path()).unwrap(), b"%PDF-1.6 body");
    assert!(!partial.as_std_path().exists());
    assert!(!std::path::Path::new(&control).exists());
}

#[test]
fn metadata_round_trips_through_list() {
    let (_temp, layout) = layout();
    layout.ensure_root().unwrap();
    let older = paper("2407.00002", NaiveDate::from_ymd_opt(2024, 7, 2).unwrap());
    let newer = paper("2407.00003", NaiveDate::from_ymd_opt(2024, 7, 9).unwrap());
    for record in [&older, &newer] {
        let path = layout.info_path(&record.id, record.published);
        Layout::write_metadata(&path, &PaperInfo::from(record)).unwrap();
    }

    let entries = layout.list_entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, "2407.00003");
    assert_eq!(entries[1].id, "2407.00002");
    assert_eq!(entries[1].updated, "2024-07-02");
    assert_eq!(entries[1].comment.as_deref(), Some("12 pages"));

    let raw = fs::read_to_string(
        layout
            .info_path(&older.id, older.published)
            .as_std_path(),
    )
    .unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    for field in [
        "id",
        "title",
        "authors",
        "abstract",
        "categories",
        "pdf_url",
        "published",
        "updated",
    ] {
        assert!(value.get(field).is_some(), "missing {field}");
    }
}

#[test]
fn list_on_empty_root_is_empty() {
    let (_temp, layout) = layout();
    assert!(layout.list_entries().unwrap().is_empty());
}
