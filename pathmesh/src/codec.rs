// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Conversion between the composable path tree and the flat wire form.
//!
//! Flattening is pre-order: each element's source is a slash-delimited
//! breadcrumb of its ancestor names, and paths received from a downstream
//! process nest under the local node that issued the call.

use crate::path::{nanos_to_secs, CriticalPath, Path, PathElement, PathNode};
use bytes::Bytes;

/// Errors from the wire representation of a [`Path`].
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The blob is not a valid length-prefixed element list.
    #[error("Malformed critical path blob: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Flattens a path tree into its wire form.
pub fn flatten(path: &CriticalPath) -> Path {
    let mut elements = Vec::new();
    for node in &path.nodes {
        add_elements(&mut elements, node, &format!("/{}", node.name));
    }
    Path::new(elements)
}

fn add_elements(elements: &mut Vec<PathElement>, node: &PathNode, prefix: &str) {
    elements.push(PathElement::new(prefix, nanos_to_secs(node.cpu_nanos)));

    for child in &node.child_path.nodes {
        add_elements(elements, child, &format!("{}/{}", prefix, child.name));
    }

    // Remote elements arrive already rooted at the callee; a leading slash
    // concatenates, anything else gets a separator inserted.
    for remote in &node.child_remote_paths {
        for element in &remote.elements {
            let source = if element.source.starts_with('/') {
                format!("{}{}", prefix, element.source)
            } else {
                format!("{}/{}", prefix, element.source)
            };
            elements.push(PathElement::new(source, element.cost_secs));
        }
    }
}

/// Encodes a wire path as a deterministic length-prefixed binary record list.
pub fn encode(path: &Path) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(bincode::serialize(&path.elements)?))
}

/// Decodes a wire path produced by [`encode`].
pub fn decode(blob: &[u8]) -> Result<Path, CodecError> {
    let elements: Vec<PathElement> = bincode::deserialize(blob)?;
    Ok(Path::new(elements))
}
