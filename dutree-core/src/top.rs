//! Largest files of a tree.

use anyhow::Result;

use crate::item::ItemRef;

/// Walk the tree under `root` and return up to `n` files, largest apparent
/// size first. Ties keep the order in which the files were met.
pub fn collect_top_files(root: &ItemRef, n: usize) -> Result<Vec<ItemRef>> {
    let mut top: Vec<ItemRef> = Vec::with_capacity(n.min(1024));
    if n == 0 {
        return Ok(top);
    }
    let mut stack = vec![root.clone()];
    while let Some(item) = stack.pop() {
        if item.is_dir() {
            // reversed so children come off the stack in listing order
            stack.extend(item.files()?.into_iter().rev());
            continue;
        }
        let size = item.size();
        if top.len() == n {
            match top.last() {
                Some(min) if size > min.size() => {
                    top.pop();
                }
                _ => continue,
            }
        }
        let at = top.partition_point(|t| t.size() >= size);
        top.insert(at, item);
    }
    Ok(top)
}
