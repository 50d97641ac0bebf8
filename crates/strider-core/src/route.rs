use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Identity;

/// One coordinate of a route.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub lat: f64,
    pub lng: f64,
}

impl RouteStep {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("route must contain at least one step")]
    Empty,
    #[error("step {index} is not a valid coordinate")]
    InvalidStep { index: usize },
    #[error("interval must be greater than zero")]
    InvalidInterval,
    #[error("speed must be a finite, non-negative km/h value")]
    InvalidSpeed,
    #[error("battery level must be between 0 and 100, got {0}")]
    InvalidBattery(f64),
}

/// A non-empty, ordered list of steps.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Route(Vec<RouteStep>);

impl Route {
    pub fn new(steps: Vec<RouteStep>) -> Result<Self, RouteError> {
        if steps.is_empty() {
            return Err(RouteError::Empty);
        }
        if let Some(index) = steps.iter().position(|s| !s.is_valid()) {
            return Err(RouteError::InvalidStep { index });
        }
        Ok(Self(steps))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: a `Route` cannot be built empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[RouteStep] {
        &self.0
    }

    /// Step at `index`, clamped into the route's bounds.
    pub fn step_clamped(&self, index: usize) -> RouteStep {
        let last = self.0.len().saturating_sub(1);
        self.0[index.min(last)]
    }
}

/// Everything one route run needs. Owned by that run alone.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub identity: Identity,
    pub route: Route,
    pub interval: Duration,
    pub speed_kmh: f64,
    pub battery: f64,
    pub expires: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    pub fn new(
        identity: Identity,
        route: Route,
        interval: Duration,
        speed_kmh: f64,
        battery: f64,
        expires: Option<DateTime<Utc>>,
    ) -> Result<Self, RouteError> {
        if interval.is_zero() {
            return Err(RouteError::InvalidInterval);
        }
        if !speed_kmh.is_finite() || speed_kmh < 0.0 {
            return Err(RouteError::InvalidSpeed);
        }
        if !battery.is_finite() || !(0.0..=100.0).contains(&battery) {
            return Err(RouteError::InvalidBattery(battery));
        }
        Ok(Self {
            identity,
            route,
            interval,
            speed_kmh,
            battery,
            expires,
        })
    }
}
