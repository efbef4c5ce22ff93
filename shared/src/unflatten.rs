use std::collections::{BTreeMap, HashMap};

use crate::{ROOT_SCOPE_NAME, ScopeNode, SignalDescriptor, UiSignal};

// ===== HIERARCHY UNFLATTENING =====
//
// Synthesis tools flatten module hierarchies into underscore-joined signal
// names. This module rebuilds a legible nested tree from those names with a
// per-scope trie over the name segments. Compiler-generated temporaries are
// kept, but corralled into one synthetic child scope per level.

/// Name of the synthetic scope collecting compiler-generated signals.
pub const GENERATED_SCOPE_NAME: &str = "compiler-generated";

/// Matches the known synthesis-tool temporary-naming patterns: a leading
/// underscore, or `_T`/`_GEN`/`_WIRE`/`_RANDOM` with an optional `_<n>`
/// suffix.
pub fn is_compiler_generated(name: &str) -> bool {
    if name.starts_with('_') {
        return true;
    }
    let base = strip_numeric_suffix(name);
    ["_T", "_GEN", "_WIRE", "_RANDOM"]
        .iter()
        .any(|suffix| base.ends_with(suffix))
}

fn strip_numeric_suffix(name: &str) -> &str {
    match name.rfind('_') {
        Some(pos)
            if pos + 1 < name.len()
                && name[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &name[..pos]
        }
        _ => name,
    }
}

// ===== SEGMENT TRIE =====

#[derive(Default)]
struct TrieNode {
    children: BTreeMap<String, TrieNode>,
    /// Signal whose name ends exactly at this node.
    terminal: Option<u32>,
    /// Signals in this subtree, terminal included.
    leaves: usize,
}

impl TrieNode {
    fn insert(&mut self, segments: &[&str], index: u32) {
        self.leaves += 1;
        match segments.split_first() {
            None => self.terminal = Some(index),
            Some((head, rest)) => {
                self.children
                    .entry((*head).to_string())
                    .or_default()
                    .insert(rest, index);
            }
        }
    }

    /// The only leaf in this subtree and its segment path from here down.
    /// Valid only when `leaves == 1` and nothing terminates at this node.
    fn single_leaf(&self) -> (u32, Vec<String>) {
        if let Some(index) = self.terminal {
            return (index, Vec::new());
        }
        let (segment, child) = self
            .children
            .iter()
            .next()
            .expect("trie node with one leaf has a child");
        let (index, mut rest) = child.single_leaf();
        rest.insert(0, segment.clone());
        (index, rest)
    }
}

fn join_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}.{segment}")
    }
}

/// Walk the trie below `node`, attaching display signals and child scopes
/// to `scope`.
///
/// Per branch segment: a signal ending exactly at the segment attaches to
/// the current scope under that segment; a branch holding exactly one
/// deeper leaf collapses into a child scope with one signal named by the
/// joined remaining segments; a branch with multiple leaves becomes a
/// child scope and the walk recurses.
fn emit(node: &TrieNode, scope: &mut ScopeNode) {
    for (segment, child) in &node.children {
        let deeper = child.leaves - usize::from(child.terminal.is_some());
        if let Some(index) = child.terminal {
            scope.ui_signals.push(UiSignal {
                index,
                name: segment.clone(),
            });
        }
        if deeper == 0 {
            continue;
        }

        let child_path = join_path(&scope.full_path, segment);
        let mut sub = ScopeNode::new(segment.clone(), child_path);
        if deeper == 1 && child.terminal.is_none() {
            let (index, rest) = child.single_leaf();
            sub.ui_signals.push(UiSignal {
                index,
                name: rest.join("_"),
            });
        } else {
            emit(child, &mut sub);
        }
        scope.children.push(sub);
    }
}

// ===== PUBLIC TRANSFORM =====

/// Produce a new display tree from a raw scope tree and the signal list.
///
/// Pure: the input tree is never mutated. Scopes whose signals are already
/// display-resolved (`ui_signals`) pass through unchanged, so re-running
/// the transform on its own output is stable. Children and signal lists
/// are sorted lexicographically at every level for reproducible output.
pub fn unflatten(tree: &ScopeNode, signals: &[SignalDescriptor]) -> ScopeNode {
    let by_index: HashMap<u32, &SignalDescriptor> =
        signals.iter().map(|s| (s.index, s)).collect();
    let mut result = unflatten_scope(tree, &by_index);
    sort_tree(&mut result);
    result
}

fn unflatten_scope(raw: &ScopeNode, by_index: &HashMap<u32, &SignalDescriptor>) -> ScopeNode {
    let mut out = ScopeNode::new(raw.name.clone(), raw.full_path.clone());
    out.ui_signals = raw.ui_signals.clone();

    let mut generated: Vec<UiSignal> = Vec::new();
    let mut trie = TrieNode::default();
    for &index in &raw.signal_indices {
        let Some(descriptor) = by_index.get(&index) else {
            continue;
        };
        if is_compiler_generated(&descriptor.name) {
            generated.push(UiSignal {
                index,
                name: descriptor.name.clone(),
            });
            continue;
        }
        let segments: Vec<&str> = descriptor
            .name
            .split('_')
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            generated.push(UiSignal {
                index,
                name: descriptor.name.clone(),
            });
        } else {
            trie.insert(&segments, index);
        }
    }
    emit(&trie, &mut out);

    for child in &raw.children {
        merge_child(&mut out, unflatten_scope(child, by_index));
    }

    if !generated.is_empty() {
        let mut generated_scope = ScopeNode::new(
            GENERATED_SCOPE_NAME,
            join_path(&raw.full_path, GENERATED_SCOPE_NAME),
        );
        generated_scope.ui_signals = generated;
        out.children.push(generated_scope);
    }

    out
}

/// A derived scope may collide with a real hierarchy scope of the same
/// name; reuse it rather than duplicating.
fn merge_child(parent: &mut ScopeNode, child: ScopeNode) {
    if let Some(existing) = parent.children.iter_mut().find(|c| c.name == child.name) {
        existing.ui_signals.extend(child.ui_signals);
        existing.signal_indices.extend(child.signal_indices);
        for grandchild in child.children {
            merge_child(existing, grandchild);
        }
    } else {
        parent.children.push(child);
    }
}

fn sort_tree(node: &mut ScopeNode) {
    node.ui_signals.sort_by(|a, b| a.name.cmp(&b.name));
    node.children.sort_by(|a, b| a.name.cmp(&b.name));
    for child in &mut node.children {
        sort_tree(child);
    }
}

// ===== DISPLAY MAP =====

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDisplay {
    pub display_name: String,
    pub scope_path: Vec<String>,
}

/// Walk a display tree into signal index → `(display_name, scope_path)`.
///
/// Purely-numeric display names follow bus/array conventions: `0` inside
/// scope `data` reports as `data[0]` with the `data` segment removed from
/// its scope path.
pub fn signal_display_map(root: &ScopeNode) -> BTreeMap<u32, SignalDisplay> {
    let mut map = BTreeMap::new();
    let mut path = Vec::new();
    walk_display(root, &mut path, &mut map);
    map
}

fn walk_display(
    node: &ScopeNode,
    path: &mut Vec<String>,
    map: &mut BTreeMap<u32, SignalDisplay>,
) {
    let named = node.name != ROOT_SCOPE_NAME;
    if named {
        path.push(node.name.clone());
    }
    for signal in &node.ui_signals {
        let numeric = !signal.name.is_empty()
            && signal.name.bytes().all(|b| b.is_ascii_digit());
        let display = if numeric && !path.is_empty() {
            SignalDisplay {
                display_name: format!("{}[{}]", path.last().unwrap(), signal.name),
                scope_path: path[..path.len() - 1].to_vec(),
            }
        } else {
            SignalDisplay {
                display_name: signal.name.clone(),
                scope_path: path.clone(),
            }
        };
        map.insert(signal.index, display);
    }
    for child in &node.children {
        walk_display(child, path, map);
    }
    if named {
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect_signal_indices;

    fn descriptor(index: u32, name: &str) -> SignalDescriptor {
        SignalDescriptor {
            name: name.to_string(),
            full_path: format!("top.mod.{name}"),
            id_code: index as u64,
            width: 1,
            index,
            ty: "wire".to_string(),
            msb: None,
            lsb: None,
        }
    }

    fn raw_scope(signals: &[&SignalDescriptor]) -> ScopeNode {
        let mut root = ScopeNode::root();
        let mut top = ScopeNode::new("top", "top");
        let mut module = ScopeNode::new("mod", "top.mod");
        module.signal_indices = signals.iter().map(|s| s.index).collect();
        top.children.push(module);
        root.children.push(top);
        root
    }

    fn child<'a>(node: &'a ScopeNode, name: &str) -> &'a ScopeNode {
        node.children
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("missing child scope '{name}'"))
    }

    #[test]
    fn detects_generated_names() {
        assert!(is_compiler_generated("_accumulator_0_io_out"));
        assert!(is_compiler_generated("_T"));
        assert!(is_compiler_generated("x_T_12"));
        assert!(is_compiler_generated("x_GEN"));
        assert!(is_compiler_generated("y_WIRE_3"));
        assert!(is_compiler_generated("z_RANDOM"));
        assert!(!is_compiler_generated("counter_value"));
        assert!(!is_compiler_generated("data_0"));
        assert!(!is_compiler_generated("wire"));
    }

    #[test]
    fn generated_signal_moves_to_synthetic_scope_and_single_leaf_collapses() {
        let signals = vec![
            descriptor(0, "_accumulator_0_io_out"),
            descriptor(1, "counter_value"),
        ];
        let raw = raw_scope(&[&signals[0], &signals[1]]);

        let tree = unflatten(&raw, &signals);
        let module = child(child(&tree, "top"), "mod");

        let generated = child(module, GENERATED_SCOPE_NAME);
        assert_eq!(generated.ui_signals.len(), 1);
        assert_eq!(generated.ui_signals[0].name, "_accumulator_0_io_out");

        let counter = child(module, "counter");
        assert_eq!(counter.ui_signals.len(), 1);
        assert_eq!(counter.ui_signals[0].name, "value");
        assert_eq!(counter.ui_signals[0].index, 1);
    }

    #[test]
    fn multiple_leaves_share_a_scope() {
        let signals = vec![
            descriptor(0, "io_in"),
            descriptor(1, "io_out"),
            descriptor(2, "clk"),
        ];
        let raw = raw_scope(&[&signals[0], &signals[1], &signals[2]]);

        let tree = unflatten(&raw, &signals);
        let module = child(child(&tree, "top"), "mod");

        assert_eq!(module.ui_signals.len(), 1);
        assert_eq!(module.ui_signals[0].name, "clk");
        let io = child(module, "io");
        let names: Vec<&str> = io.ui_signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["in", "out"]);
    }

    #[test]
    fn signal_ending_at_a_branch_stays_in_parent() {
        let signals = vec![descriptor(0, "ready"), descriptor(1, "ready_valid")];
        let raw = raw_scope(&[&signals[0], &signals[1]]);

        let tree = unflatten(&raw, &signals);
        let module = child(child(&tree, "top"), "mod");

        assert_eq!(module.ui_signals.len(), 1);
        assert_eq!(module.ui_signals[0].name, "ready");
        let ready = child(module, "ready");
        assert_eq!(ready.ui_signals[0].name, "valid");
    }

    #[test]
    fn deterministic_and_idempotent() {
        let signals = vec![
            descriptor(0, "io_out"),
            descriptor(1, "io_in"),
            descriptor(2, "_T_4"),
            descriptor(3, "counter_value"),
        ];
        let raw = raw_scope(&[&signals[0], &signals[1], &signals[2], &signals[3]]);

        let first = unflatten(&raw, &signals);
        let second = unflatten(&raw, &signals);
        assert_eq!(first, second);

        let again = unflatten(&first, &signals);
        assert_eq!(again, first);
    }

    #[test]
    fn every_signal_appears_exactly_once() {
        let signals = vec![
            descriptor(0, "io_out"),
            descriptor(1, "io_in"),
            descriptor(2, "_GEN_7"),
            descriptor(3, "clk"),
            descriptor(4, "data_0"),
            descriptor(5, "data_1"),
        ];
        let raw = raw_scope(&signals.iter().collect::<Vec<_>>());

        let tree = unflatten(&raw, &signals);
        let mut indices = Vec::new();
        collect_signal_indices(&tree, &mut indices);
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn numeric_names_merge_with_parent_in_display_map() {
        let signals = vec![descriptor(0, "data_0"), descriptor(1, "data_1")];
        let raw = raw_scope(&[&signals[0], &signals[1]]);

        let tree = unflatten(&raw, &signals);
        let map = signal_display_map(&tree);

        assert_eq!(map[&0].display_name, "data[0]");
        assert_eq!(map[&1].display_name, "data[1]");
        assert_eq!(map[&0].scope_path, vec!["top", "mod"]);
    }

    #[test]
    fn reuses_existing_hierarchy_scope() {
        let signals = vec![descriptor(0, "alu_carry"), descriptor(1, "alu_zero")];
        let mut raw = raw_scope(&[&signals[0], &signals[1]]);
        // A real child scope named like the trie prefix already exists.
        raw.children[0].children[0]
            .children
            .push(ScopeNode::new("alu", "top.mod.alu"));

        let tree = unflatten(&raw, &signals);
        let module = child(child(&tree, "top"), "mod");
        let alus: Vec<_> = module.children.iter().filter(|c| c.name == "alu").collect();
        assert_eq!(alus.len(), 1);
        assert_eq!(alus[0].ui_signals.len(), 2);
    }
}
