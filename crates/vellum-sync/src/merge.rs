//! Line-based three-way merge.
//!
//! Each side is aligned against the common ancestor with an LCS matching;
//! lines unchanged on both sides become synchronization points, and the
//! regions between them are merged region by region:
//!   - a region changed on one side only takes that side
//!   - identical changes collapse to one copy
//!   - insertions made by both sides at the same anchor are BOTH kept, left
//!     side first (callers order the sides with the deterministic
//!     tie-break), so neither write is dropped
//!   - a change/change collision is emitted with explicit conflict markers
//!     and flags the merge as not clean

/// Result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub content: String,
    /// False when the content contains conflict markers.
    pub clean: bool,
}

/// Merge with the default side labels `local` / `remote`.
pub fn merge(ancestor: &str, left: &str, right: &str) -> MergeOutcome {
    merge_labeled(ancestor, left, right, "local", "remote")
}

/// Merge `left` and `right` against their common `ancestor`.
pub fn merge_labeled(
    ancestor: &str,
    left: &str,
    right: &str,
    left_label: &str,
    right_label: &str,
) -> MergeOutcome {
    let anc: Vec<&str> = ancestor.lines().collect();
    let lhs: Vec<&str> = left.lines().collect();
    let rhs: Vec<&str> = right.lines().collect();

    let stable = sync_points(&anc, &lhs, &rhs);

    let mut out: Vec<String> = Vec::new();
    let mut clean = true;
    let (mut a0, mut l0, mut r0) = (0usize, 0usize, 0usize);

    for &(ai, li, ri) in stable.iter().chain(std::iter::once(&(
        anc.len(),
        lhs.len(),
        rhs.len(),
    ))) {
        merge_region(
            &anc[a0..ai],
            &lhs[l0..li],
            &rhs[r0..ri],
            left_label,
            right_label,
            &mut out,
            &mut clean,
        );
        if ai < anc.len() {
            out.push(anc[ai].to_string());
        }
        a0 = ai + 1;
        l0 = li + 1;
        r0 = ri + 1;
    }

    let mut content = out.join("\n");
    if !content.is_empty() && (left.ends_with('\n') || right.ends_with('\n')) {
        content.push('\n');
    }
    MergeOutcome { content, clean }
}

/// True when the text contains merge conflict markers.
pub fn has_conflict_markers(text: &str) -> bool {
    text.lines()
        .any(|line| line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>") || line == "=======")
}

fn merge_region(
    anc: &[&str],
    left: &[&str],
    right: &[&str],
    left_label: &str,
    right_label: &str,
    out: &mut Vec<String>,
    clean: &mut bool,
) {
    let extend = |out: &mut Vec<String>, lines: &[&str]| {
        out.extend(lines.iter().map(|l| l.to_string()));
    };

    if left == anc && right == anc {
        extend(out, anc);
    } else if left == anc {
        extend(out, right);
    } else if right == anc {
        extend(out, left);
    } else if left == right {
        extend(out, left);
    } else if anc.is_empty() {
        // Insert/insert at the same anchor: keep both, left first
        extend(out, left);
        extend(out, right);
    } else {
        out.push(format!("<<<<<<< {left_label}"));
        extend(out, left);
        out.push("=======".to_string());
        extend(out, right);
        out.push(format!(">>>>>>> {right_label}"));
        *clean = false;
    }
}

/// Ancestor lines matched by LCS in both sides, as (ancestor, left, right)
/// index triples. Monotone in all three coordinates.
fn sync_points(anc: &[&str], left: &[&str], right: &[&str]) -> Vec<(usize, usize, usize)> {
    let a2l: std::collections::HashMap<usize, usize> =
        lcs_pairs(anc, left).into_iter().collect();
    let a2r: std::collections::HashMap<usize, usize> =
        lcs_pairs(anc, right).into_iter().collect();

    (0..anc.len())
        .filter_map(|ai| match (a2l.get(&ai), a2r.get(&ai)) {
            (Some(&li), Some(&ri)) => Some((ai, li, ri)),
            _ => None,
        })
        .collect()
}

/// Longest common subsequence of two line slices, as index pairs.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if a[i] == b[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}
