//! Circular and polygon geofences with per-fence transition tracking.
//!
//! Geofence definitions are supplied by the host application as JSON:
//!
//! ```json
//! {
//!   "notification": {"title": "Welcome", "body": "You arrived"},
//!   "circular_geofences": {
//!     "home": {"center": {"lat": 43.07, "lon": -89.40}, "radius": 150}
//!   },
//!   "polygon_geofences": {
//!     "campus": [{"lat": 43.0, "lon": -89.5}, {"lat": 43.1, "lon": -89.5}, {"lat": 43.1, "lon": -89.3}]
//!   }
//! }
//! ```
//!
//! Each accepted sample moves every fence through its state machine. A fence
//! that was entered reports [`GeofenceState::Activated`] for exactly one
//! sample, then [`GeofenceState::Active`]; leaving works the same way with
//! `Inactivated` and `Inactive`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use locsync_types::Position;

/// Mean Earth radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two positions in metres.
pub fn haversine_distance(a: Position, b: Position) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// A geographic area.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Everything within `radius_m` metres of `center`.
    Circle {
        /// Centre of the circle.
        center: Position,
        /// Radius in metres.
        radius_m: f64,
    },
    /// A closed polygon; the last vertex connects back to the first.
    Polygon(Vec<Position>),
}

impl Shape {
    /// Whether `point` lies inside the shape.
    ///
    /// A circle with a non-positive radius contains nothing; a polygon with
    /// fewer than three vertices contains nothing.
    pub fn contains(&self, point: Position) -> bool {
        match self {
            Shape::Circle { center, radius_m } => {
                *radius_m > 0.0 && haversine_distance(*center, point) <= *radius_m
            }
            Shape::Polygon(vertices) => {
                if vertices.len() < 3 {
                    return false;
                }
                let crossings = vertices
                    .iter()
                    .zip(vertices.iter().cycle().skip(1))
                    .filter(|(a, b)| ray_crosses_segment(point, **a, **b))
                    .count();
                crossings % 2 == 1
            }
        }
    }
}

/// Whether a ray cast east from `point` crosses the segment `a`-`b`.
///
/// Longitudes are shifted into `0..360` so polygons spanning the
/// antimeridian work.
fn ray_crosses_segment(point: Position, a: Position, b: Position) -> bool {
    let shift = |lon: f64| if lon < 0.0 { lon + 360.0 } else { lon };

    // b is always the upper end
    let (a, b) = if a.latitude > b.latitude { (b, a) } else { (a, b) };

    let px = shift(point.longitude);
    let mut py = point.latitude;
    let (ax, ay) = (shift(a.longitude), a.latitude);
    let (bx, by) = (shift(b.longitude), b.latitude);

    // A ray through a vertex would be counted twice
    if py == ay || py == by {
        py += 1e-8;
    }

    if py > by || py < ay || px > ax.max(bx) {
        return false;
    }
    if px < ax.min(bx) {
        return true;
    }

    let edge_slope = if ax != bx {
        (by - ay) / (bx - ax)
    } else {
        f64::MAX
    };
    let point_slope = if ax != px {
        (py - ay) / (px - ax)
    } else {
        f64::MAX
    };
    point_slope >= edge_slope
}

/// Where a sample stands relative to a geofence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeofenceState {
    /// No sample has been evaluated yet.
    #[default]
    Unknown,
    /// The latest sample entered the fence.
    Activated,
    /// Inside the fence for at least two consecutive samples.
    Active,
    /// The latest sample left the fence.
    Inactivated,
    /// Outside the fence for at least two consecutive samples.
    Inactive,
}

impl GeofenceState {
    /// Persisted form of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceState::Unknown => "",
            GeofenceState::Activated => "activated",
            GeofenceState::Active => "active",
            GeofenceState::Inactivated => "inactivated",
            GeofenceState::Inactive => "inactive",
        }
    }

    /// The state after evaluating one more sample.
    #[must_use]
    pub fn next(self, inside: bool) -> Self {
        use GeofenceState::*;
        match (inside, self) {
            (true, Unknown | Inactivated | Inactive) => Activated,
            (true, Activated | Active) => Active,
            (false, Unknown | Activated | Active) => Inactivated,
            (false, Inactivated | Inactive) => Inactive,
        }
    }
}

impl fmt::Display for GeofenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeofenceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(GeofenceState::Unknown),
            "activated" => Ok(GeofenceState::Activated),
            "active" => Ok(GeofenceState::Active),
            "inactivated" => Ok(GeofenceState::Inactivated),
            "inactive" => Ok(GeofenceState::Inactive),
            other => Err(format!("unknown geofence state '{other}'")),
        }
    }
}

/// Notification text shown when a fence is entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeofenceNotification {
    /// Title line.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PointDef {
    lat: f64,
    lon: f64,
}

impl From<PointDef> for Position {
    fn from(point: PointDef) -> Self {
        Position::new(point.lat, point.lon)
    }
}

/// Radii arrive either as numbers or as numeric strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RadiusDef {
    Number(f64),
    Text(String),
}

impl RadiusDef {
    fn metres(&self) -> Result<f64, String> {
        match self {
            RadiusDef::Number(m) => Ok(*m),
            RadiusDef::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| format!("invalid radius '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CircleDef {
    center: PointDef,
    radius: RadiusDef,
}

/// Geofence definitions as supplied by the host application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeofenceDefinitions {
    /// Notification shown when a fence is entered.
    #[serde(default)]
    pub notification: Option<GeofenceNotification>,
    #[serde(default)]
    circular_geofences: BTreeMap<String, CircleDef>,
    #[serde(default)]
    polygon_geofences: BTreeMap<String, Vec<PointDef>>,
}

impl GeofenceDefinitions {
    /// Parse definitions from their JSON form.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse definitions from an already decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Number of fences defined.
    pub fn len(&self) -> usize {
        self.circular_geofences.len() + self.polygon_geofences.len()
    }

    /// Whether no fence is defined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the shapes, rejecting malformed radii and reused identifiers.
    pub fn shapes(&self) -> crate::Result<BTreeMap<String, Shape>> {
        let mut shapes = BTreeMap::new();
        for (id, circle) in &self.circular_geofences {
            let radius_m = circle
                .radius
                .metres()
                .map_err(|e| crate::Error::InvalidSettings(format!("geofence {id}: {e}")))?;
            shapes.insert(
                id.clone(),
                Shape::Circle {
                    center: circle.center.into(),
                    radius_m,
                },
            );
        }
        for (id, points) in &self.polygon_geofences {
            if shapes.contains_key(id) {
                return Err(crate::Error::InvalidSettings(format!(
                    "geofence {id} is defined twice"
                )));
            }
            shapes.insert(
                id.clone(),
                Shape::Polygon(points.iter().copied().map(Position::from).collect()),
            );
        }
        Ok(shapes)
    }
}

/// Fences whose state changed on the latest sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transitions {
    /// Fences entered, in identifier order.
    pub activated: Vec<String>,
    /// Fences left, in identifier order.
    pub inactivated: Vec<String>,
}

impl Transitions {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.activated.is_empty() && self.inactivated.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Fence {
    shape: Shape,
    state: GeofenceState,
}

/// Tracks the state of every defined fence.
#[derive(Debug, Clone, Default)]
pub struct GeofenceTracker {
    fences: BTreeMap<String, Fence>,
    notification: Option<GeofenceNotification>,
}

impl GeofenceTracker {
    /// Build a tracker with every fence in the unknown state.
    pub fn new(definitions: &GeofenceDefinitions) -> crate::Result<Self> {
        let fences = definitions
            .shapes()?
            .into_iter()
            .map(|(id, shape)| {
                (
                    id,
                    Fence {
                        shape,
                        state: GeofenceState::Unknown,
                    },
                )
            })
            .collect();

        Ok(Self {
            fences,
            notification: definitions.notification.clone(),
        })
    }

    /// Number of fences tracked.
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    /// Whether no fence is tracked.
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    /// Notification configured alongside the fences.
    pub fn notification(&self) -> Option<&GeofenceNotification> {
        self.notification.as_ref()
    }

    /// Whether the last position was inside any fence.
    pub fn is_inside(&self) -> bool {
        self.fences.values().any(|fence| {
            matches!(
                fence.state,
                GeofenceState::Activated | GeofenceState::Active
            )
        })
    }

    /// Persisted form of all states.
    pub fn states(&self) -> BTreeMap<String, String> {
        self.fences
            .iter()
            .map(|(id, fence)| (id.clone(), fence.state.as_str().to_string()))
            .collect()
    }

    /// Restore states saved by [`states`](Self::states).
    ///
    /// Entries for unknown fences and unparseable states are ignored.
    pub fn restore_states(&mut self, states: &BTreeMap<String, String>) {
        for (id, state) in states {
            let Some(fence) = self.fences.get_mut(id) else {
                continue;
            };
            match state.parse() {
                Ok(state) => fence.state = state,
                Err(e) => debug!("Ignoring stored state for geofence {}: {}", id, e),
            }
        }
    }

    /// Forget every fence's state.
    pub fn reset(&mut self) {
        for fence in self.fences.values_mut() {
            fence.state = GeofenceState::Unknown;
        }
    }

    /// Evaluate one position against every fence.
    pub fn update(&mut self, position: Position) -> Transitions {
        let mut transitions = Transitions::default();

        for (id, fence) in &mut self.fences {
            fence.state = fence.state.next(fence.shape.contains(position));
            match fence.state {
                GeofenceState::Activated => transitions.activated.push(id.clone()),
                GeofenceState::Inactivated => transitions.inactivated.push(id.clone()),
                _ => {}
            }
        }

        debug!(
            "Geofences updated: {} activated, {} inactivated",
            transitions.activated.len(),
            transitions.inactivated.len()
        );
        transitions
    }
}
