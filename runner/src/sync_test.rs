use crate::sync::{create_dir_atomically, partial_path, write_atomically};
use std::{fs, io, path::Path};

#[test]
pub fn partial_is_a_hidden_sibling() {
    assert_eq!(
        partial_path(Path::new("/study/tree.yaml")),
        Path::new("/study/.partial_tree.yaml")
    );
}

#[test]
pub fn files_are_replaced_whole() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.yaml");

    write_atomically(&path, "first").unwrap();
    write_atomically(&path, "second").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
pub fn directories_appear_complete_or_not_at_all() {
    let dir = tempfile::tempdir().unwrap();
    let node = dir.path().join("x_1");

    let failed = create_dir_atomically(&node, |partial| {
        fs::write(partial.join("generation_1.sh"), "echo")?;
        Err(io::Error::new(io::ErrorKind::Other, "interrupted"))
    });
    assert!(failed.is_err());
    assert!(!node.exists());
    assert!(!partial_path(&node).exists());

    // leftover of a crashed build
    fs::create_dir(partial_path(&node)).unwrap();
    fs::write(partial_path(&node).join("stale"), "").unwrap();
    create_dir_atomically(&node, |partial| fs::write(partial.join("generation_1.sh"), "echo"))
        .unwrap();

    assert!(node.join("generation_1.sh").is_file());
    assert!(!node.join("stale").exists());
}
