//! Graphviz rendering of a stored block tree.
//!
//! Render the output with `dot -Tsvg -o tree.svg tree.dot`.

use std::io::Write;
use std::path::Path;

use rfs_protocol::config::DEFAULT_BACK_CHECK_DEPTH;
use rfs_protocol::crypto::short_hex;
use rfs_protocol::storage::snapshot::{self, SnapshotError};
use rfs_protocol::storage::{BlockTree, ChainParams};

/// Load a snapshot for display. Proof of work is not checked, since the
/// network's difficulties are not known here; the structure still is.
pub fn load_tree(path: &Path) -> Result<BlockTree, SnapshotError> {
    let params = ChainParams {
        op_difficulty: 0,
        noop_difficulty: 0,
        back_check_depth: DEFAULT_BACK_CHECK_DEPTH,
    };
    snapshot::restore(path, params)
}

/// Write `tree` as a dot digraph. Op blocks are boxes, the canonical chain
/// is drawn bold.
pub fn render_dot<W: Write + ?Sized>(tree: &BlockTree, writer: &mut W) -> std::io::Result<()> {
    writeln!(writer, "digraph BlockTree {{")?;
    writeln!(writer, "  rankdir=LR;")?;
    writeln!(writer, "  node [fontname=monospace];")?;

    let genesis = tree.genesis();
    writeln!(
        writer,
        "  \"{}\" [label=\"genesis\" shape=doublecircle style=bold];",
        genesis.hash_hex()
    )?;

    for block in tree.blocks() {
        let canonical = tree.is_canonical(&block.hash);
        let shape = if block.is_op { "box" } else { "ellipse" };
        let style = if canonical { " style=bold" } else { "" };
        let label = if block.is_op {
            format!("{}\\n{} ({} ops)", short_hex(&block.hash), block.miner_id, block.ops.len())
        } else {
            format!("{}\\n{}", short_hex(&block.hash), block.miner_id)
        };
        writeln!(
            writer,
            "  \"{}\" [label=\"{}\" shape={}{}];",
            block.hash_hex(),
            label.replace('"', "\\\""),
            shape,
            style
        )?;
        let edge = if canonical { " [style=bold]" } else { "" };
        writeln!(
            writer,
            "  \"{}\" -> \"{}\"{};",
            block.prev_hash_hex(),
            block.hash_hex(),
            edge
        )?;
    }

    writeln!(writer, "}}")
}

/// Convenience for tests and the `inspect` command.
pub fn render_dot_to_string(tree: &BlockTree) -> std::io::Result<String> {
    let mut buffer = Vec::new();
    render_dot(tree, &mut buffer)?;
    String::from_utf8(buffer).map_err(std::io::Error::other)
}
