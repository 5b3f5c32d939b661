use crate::model::{EmptyReason, MatchedNode, MatchedSegment, ReferenceNode, Stage, TrackInfo};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Nodes touched by each track's matched segments.
///
/// One row per (node, track): a node visited by three tracks appears three
/// times. Tracks with no matched segments contribute nothing.
pub fn extract_nodes(segments: &[MatchedSegment], nodes: &[ReferenceNode]) -> Stage<Vec<MatchedNode>> {
    let mut by_track: BTreeMap<&TrackInfo, BTreeSet<i64>> = BTreeMap::new();
    for row in segments {
        let ids = by_track.entry(&row.track).or_default();
        ids.extend(row.segment.osm_id_from);
        ids.extend(row.segment.osm_id_to);
    }

    let mut nodes_by_id: HashMap<i64, Vec<&ReferenceNode>> = HashMap::new();
    for node in nodes {
        nodes_by_id.entry(node.osm_id).or_default().push(node);
    }

    let mut matched = Vec::new();
    for (track, ids) in by_track {
        for id in ids {
            let Some(found) = nodes_by_id.get(&id) else {
                continue;
            };
            matched.extend(found.iter().map(|node| MatchedNode {
                node: (*node).clone(),
                track: track.clone(),
            }));
        }
    }

    tracing::info!("Extracted {} matched node rows", matched.len());
    if matched.is_empty() {
        Stage::Empty(EmptyReason::NoNodes)
    } else {
        Stage::Rows(matched)
    }
}
