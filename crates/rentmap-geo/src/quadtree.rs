//! Point quadtree for viewport queries over listings
//!
//! The tree covers a fixed geographic box. Leaves hold entities until they exceed
//! `max_items_per_node`, then split into NW/NE/SW/SE quadrants at the midpoint latitude and
//! longitude, unless `max_depth` has been reached (this keeps dense clusters of coincident
//! points from recursing forever).
//!
//! # Quadrant seams
//!
//! Quadrant membership is half-open: a node owns a point when `min <= p < max` on each axis,
//! and the upper edge is inclusive only where it coincides with the root's upper edge. Every
//! point inside the root box therefore lands in exactly one leaf, so a point lying exactly on
//! a split line is never duplicated or dropped. Query boxes use closed containment.

use crate::config::IndexConfig;
use crate::{BoundingBox, GeoError, GeoPoint, IndexedEntity, Result, utils};
use smallvec::SmallVec;

/// Summary of the tree shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Entities accepted (inside the root bounds)
    pub entity_count: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    /// Deepest leaf, root = 0
    pub max_leaf_depth: u32,
}

/// Root container for the quadtree spatial index
#[derive(Debug, Clone)]
pub struct SpatialIndex<P = serde_json::Value> {
    root: QuadNode<P>,
    config: IndexConfig,
    len: usize,
}

/// A single node in the quadtree
#[derive(Debug, Clone)]
struct QuadNode<P> {
    bounds: BoundingBox,
    depth: u32,
    /// Upper latitude edge is inclusive (shared with the root's upper edge)
    closed_lat: bool,
    /// Upper longitude edge is inclusive (shared with the root's upper edge)
    closed_lng: bool,
    /// Entities held by a leaf; always empty once split
    items: Vec<IndexedEntity<P>>,
    /// Child nodes (NW, NE, SW, SE) if subdivided
    children: Option<Box<[QuadNode<P>; 4]>>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<P: Clone> SpatialIndex<P> {
    /// Create an empty index covering `bounds`
    pub fn build(bounds: BoundingBox, config: IndexConfig) -> Result<Self> {
        bounds.validate()?;
        config.validate()?;
        let config = config.clamped();

        Ok(Self {
            root: QuadNode::new_root(bounds),
            config,
            len: 0,
        })
    }

    /// Create an index and insert every entity
    pub fn build_from<I>(bounds: BoundingBox, config: IndexConfig, entities: I) -> Result<Self>
    where
        I: IntoIterator<Item = IndexedEntity<P>>,
    {
        #[cfg(feature = "profiling")]
        profiling::scope!("SpatialIndex::build_from");

        let mut index = Self::build(bounds, config)?;
        let mut dropped = 0usize;
        for entity in entities {
            if !index.insert(entity) {
                dropped += 1;
            }
        }

        tracing::debug!(
            entities = index.len,
            dropped,
            max_items_per_node = config.max_items_per_node,
            max_depth = config.max_depth,
            "Built spatial index"
        );
        Ok(index)
    }

    /// Insert an entity, returning whether it was stored
    ///
    /// Entities outside the root bounds (or with non-finite coordinates) are not an error:
    /// the caller may be working with stale bounds. They are silently skipped.
    pub fn insert(&mut self, entity: IndexedEntity<P>) -> bool {
        let accepted = self.root.insert(entity, &self.config);
        if accepted {
            self.len += 1;
        }
        accepted
    }

    /// All entities whose position lies inside `query_box` (edges included)
    ///
    /// Result order is unspecified.
    pub fn query(&self, query_box: &BoundingBox) -> Result<Vec<&IndexedEntity<P>>> {
        #[cfg(feature = "profiling")]
        profiling::scope!("SpatialIndex::query");

        query_box.validate()?;

        let mut results = Vec::new();
        self.root.query(query_box, &mut |entity| results.push(entity));
        Ok(results)
    }

    /// All entities within `radius_km` of `center` (spherical approximation)
    ///
    /// The search box does not wrap across the antimeridian.
    pub fn query_radius(
        &self,
        center: GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<&IndexedEntity<P>>> {
        if !center.is_finite() {
            return Err(GeoError::InvalidBounds(format!(
                "non-finite radius center {center:?}"
            )));
        }
        if !radius_km.is_finite() || radius_km < 0.0 {
            return Err(GeoError::InvalidBounds(format!(
                "radius must be finite and non-negative, got {radius_km}"
            )));
        }

        let search_box = BoundingBox::around(center, radius_km);
        let mut results = Vec::new();
        self.root.query(&search_box, &mut |entity| {
            if utils::haversine_km(center, entity.position()) <= radius_km {
                results.push(entity);
            }
        });
        Ok(results)
    }
}

impl<P> SpatialIndex<P> {
    /// Number of entities stored
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Coverage area of the root node
    pub fn bounds(&self) -> BoundingBox {
        self.root.bounds
    }

    pub fn config(&self) -> IndexConfig {
        self.config
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            entity_count: self.len,
            ..IndexStats::default()
        };
        self.root.collect_stats(&mut stats);
        stats
    }
}

impl<P> QuadNode<P> {
    fn new_root(bounds: BoundingBox) -> Self {
        Self::new_child(bounds, 0, true, true)
    }

    fn new_child(bounds: BoundingBox, depth: u32, closed_lat: bool, closed_lng: bool) -> Self {
        Self {
            bounds,
            depth,
            closed_lat,
            closed_lng,
            items: Vec::new(),
            children: None,
        }
    }

    /// Half-open membership test (see module docs)
    #[inline]
    fn owns(&self, lat: f64, lng: f64) -> bool {
        let b = &self.bounds;
        let lat_ok =
            lat >= b.min_lat && (lat < b.max_lat || (self.closed_lat && lat == b.max_lat));
        let lng_ok =
            lng >= b.min_lng && (lng < b.max_lng || (self.closed_lng && lng == b.max_lng));
        lat_ok && lng_ok
    }

    fn collect_stats(&self, stats: &mut IndexStats) {
        stats.node_count += 1;
        match &self.children {
            Some(children) => {
                for child in children.iter() {
                    child.collect_stats(stats);
                }
            }
            None => {
                stats.leaf_count += 1;
                stats.max_leaf_depth = stats.max_leaf_depth.max(self.depth);
            }
        }
    }

    /// Depth-first traversal, pruning subtrees that do not overlap `query_box`
    fn query<'a>(&'a self, query_box: &BoundingBox, emit: &mut dyn FnMut(&'a IndexedEntity<P>)) {
        if !self.bounds.intersects(query_box) {
            return;
        }

        match &self.children {
            Some(children) => {
                for child in children.iter() {
                    child.query(query_box, emit);
                }
            }
            None => {
                // A leaf can hold points near but outside the query box
                for entity in &self.items {
                    if query_box.contains(entity.lat, entity.lng) {
                        emit(entity);
                    }
                }
            }
        }
    }
}

impl<P: Clone> QuadNode<P> {
    fn insert(&mut self, entity: IndexedEntity<P>, config: &IndexConfig) -> bool {
        if !self.owns(entity.lat, entity.lng) {
            return false;
        }

        if self.children.is_some() {
            return self.insert_into_children(entity, config);
        }

        self.items.push(entity);
        if self.items.len() > config.max_items_per_node && self.depth < config.max_depth {
            self.subdivide(config);
        }
        true
    }

    /// Hand an entity to every child that owns it
    ///
    /// With half-open seams exactly one child matches, but the fan-out does not rely on it.
    fn insert_into_children(&mut self, entity: IndexedEntity<P>, config: &IndexConfig) -> bool {
        let Some(children) = &mut self.children else {
            return false;
        };

        let owners: SmallVec<[usize; 4]> = children
            .iter()
            .enumerate()
            .filter(|(_, child)| child.owns(entity.lat, entity.lng))
            .map(|(i, _)| i)
            .collect();

        let Some((&last, rest)) = owners.split_last() else {
            return false;
        };

        let mut accepted = false;
        for &i in rest {
            accepted |= children[i].insert(entity.clone(), config);
        }
        accepted |= children[last].insert(entity, config);
        accepted
    }

    /// Split this leaf into 4 children and redistribute its items one level deeper
    fn subdivide(&mut self, config: &IndexConfig) {
        if self.children.is_some() {
            return; // Already subdivided
        }

        let [nw, ne, sw, se] = self.bounds.quarter();
        let depth = self.depth + 1;

        // Children on the parent's upper edges inherit its inclusive edges
        self.children = Some(Box::new([
            QuadNode::new_child(nw, depth, self.closed_lat, false),
            QuadNode::new_child(ne, depth, self.closed_lat, self.closed_lng),
            QuadNode::new_child(sw, depth, false, false),
            QuadNode::new_child(se, depth, false, self.closed_lng),
        ]));

        for entity in std::mem::take(&mut self.items) {
            if !self.insert_into_children(entity, config) {
                tracing::warn!(depth, "Entity lost its quadrant during subdivision");
            }
        }
    }
}
