//! Range trilateration by bounded nonlinear least squares
//!
//! The engine works in two phases:
//! - filtering: measurements whose anchor is missing from the active-anchor snapshot are
//!   dropped, and at least [`MIN_MEASUREMENTS`] must survive;
//! - a single Levenberg-Marquardt solve with a trust region, projected onto the search
//!   cube `[-search_bound_m, search_bound_m]^3`, minimizing
//!   `r_i = ||p - anchor_i|| - distance_i`.
//!
//! Accuracy is the worst absolute residual at the solution, in meters. All measurements are
//! weighted equally; there is no outlier rejection.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::{AnchorSnapshot, Measurement, Point3, MIN_MEASUREMENTS};
use crate::utils::config::SolverConfig;
use crate::validation::error::TrilaterationError;

/// Minimum ratio of actual to predicted cost reduction for a step to be accepted
const MIN_GAIN_RATIO: f64 = 1e-4;
const MAX_DAMPING: f64 = 1e12;
const MIN_DAMPING: f64 = 1e-12;

/// Result of a successful solve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrilaterationSolution {
    pub position: Point3,
    /// `max |r_i|` at the solution (meters)
    pub accuracy: f64,
    /// Residual per usable measurement, in input order
    pub residuals: Vec<f64>,
    pub anchors_used: usize,
    pub iterations: usize,
    /// False when the iteration cap was hit before any tolerance was met
    pub converged: bool,
}

/// Pure trilateration engine; holds only solver parameters
#[derive(Debug, Clone, Default)]
pub struct TrilaterationEngine {
    config: SolverConfig,
}

struct Minimum {
    estimate: Vector3<f64>,
    iterations: usize,
    converged: bool,
}

impl TrilaterationEngine {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Estimate a tag position from its range measurements.
    ///
    /// `initial_guess` defaults to the origin and is projected into the search cube.
    pub fn solve(
        &self,
        measurements: &[Measurement],
        anchors: &AnchorSnapshot,
        initial_guess: Option<Point3>,
    ) -> Result<TrilaterationSolution, TrilaterationError> {
        let (positions, ranges) = Self::usable_measurements(measurements, anchors);

        if positions.len() < MIN_MEASUREMENTS {
            return Err(TrilaterationError::InsufficientMeasurements {
                usable: positions.len(),
                required: MIN_MEASUREMENTS,
            });
        }

        let bound = self.config.search_bound_m.abs();
        let start = project(&initial_guess.unwrap_or_else(Point3::origin).to_vector(), bound);

        let minimum = self.minimize(&positions, &ranges, start, bound);
        let estimate = minimum.estimate;

        if !estimate.iter().all(|c| c.is_finite()) {
            return Err(TrilaterationError::SolverDivergence {
                reason: format!(
                    "non-finite estimate ({}, {}, {}) after {} iterations",
                    estimate.x, estimate.y, estimate.z, minimum.iterations
                ),
            });
        }

        let residuals: Vec<f64> = positions
            .iter()
            .zip(&ranges)
            .map(|(anchor, range)| (estimate - anchor).norm() - range)
            .collect();

        if let Some(bad) = residuals.iter().find(|r| !r.is_finite()) {
            return Err(TrilaterationError::SolverDivergence {
                reason: format!("non-finite residual {}", bad),
            });
        }

        let accuracy = residuals.iter().fold(0.0_f64, |worst, r| worst.max(r.abs()));

        Ok(TrilaterationSolution {
            position: Point3::from_vector(&estimate),
            accuracy,
            anchors_used: positions.len(),
            residuals,
            iterations: minimum.iterations,
            converged: minimum.converged,
        })
    }

    /// Keep only measurements whose anchor is in the snapshot
    fn usable_measurements(
        measurements: &[Measurement],
        anchors: &AnchorSnapshot,
    ) -> (Vec<Vector3<f64>>, Vec<f64>) {
        measurements
            .iter()
            .filter_map(|m| anchors.get(&m.anchor_id).map(|p| (p.to_vector(), m.distance_m)))
            .unzip()
    }

    /// Projected Levenberg-Marquardt with trust region and gain-ratio control
    fn minimize(
        &self,
        positions: &[Vector3<f64>],
        ranges: &[f64],
        start: Vector3<f64>,
        bound: f64,
    ) -> Minimum {
        let max_radius = 2.0 * 3.0_f64.sqrt() * bound;
        let mut trust_radius = self.config.initial_trust_radius_m.min(max_radius);
        let mut lambda = self.config.initial_damping;

        let mut estimate = start;
        let (mut residuals, mut jacobian) = compute_residuals_and_jacobian(positions, ranges, &estimate);
        let mut cost = residuals.dot(&residuals);

        for iteration in 0..self.config.max_iterations {
            if !cost.is_finite() {
                return Minimum { estimate, iterations: iteration, converged: false };
            }
            if cost <= self.config.cost_tolerance {
                return Minimum { estimate, iterations: iteration, converged: true };
            }

            let jt_j = jacobian.tr_mul(&jacobian);
            let jt_r = jacobian.tr_mul(&residuals);
            let gradient = Vector3::new(jt_r[0], jt_r[1], jt_r[2]);

            // Descent through a face the estimate already sits on cannot be taken
            let free_gradient = Vector3::from_fn(|i, _| {
                if pushes_outward(estimate[i], -gradient[i], bound) {
                    0.0
                } else {
                    gradient[i]
                }
            });
            if free_gradient.amax() <= self.config.gradient_tolerance {
                return Minimum { estimate, iterations: iteration, converged: true };
            }

            // Levenberg damping on the identity keeps the system solvable when a
            // coordinate has no influence yet (e.g. starting in the anchors' plane)
            let mut augmented = Matrix3::from_iterator(jt_j.iter().cloned());
            for i in 0..3 {
                augmented[(i, i)] += lambda;
            }

            let step = match bounded_step(&augmented, &gradient, &estimate, bound) {
                Some(step) => step,
                None => {
                    lambda = (lambda * 10.0).max(MIN_DAMPING);
                    if lambda > MAX_DAMPING {
                        return Minimum { estimate, iterations: iteration, converged: false };
                    }
                    continue;
                }
            };

            let step_norm = step.norm();
            let step = if step_norm > trust_radius {
                step * (trust_radius / step_norm)
            } else {
                step
            };

            let candidate = project(&(estimate + step), bound);
            let taken = candidate - estimate;
            let tolerance = self.config.step_tolerance * (self.config.step_tolerance + estimate.norm());

            if taken.norm() <= tolerance {
                // Either at a minimum or pinned against the search cube
                return Minimum { estimate, iterations: iteration, converged: true };
            }

            let (new_residuals, new_jacobian) = compute_residuals_and_jacobian(positions, ranges, &candidate);
            let new_cost = new_residuals.dot(&new_residuals);

            let predicted_reduction = compute_predicted_reduction(&residuals, &jacobian, &taken);
            let actual_reduction = cost - new_cost;
            let gain_ratio = if predicted_reduction > 0.0 {
                actual_reduction / predicted_reduction
            } else {
                -1.0
            };

            if gain_ratio > MIN_GAIN_RATIO && new_cost.is_finite() {
                estimate = candidate;
                residuals = new_residuals;
                jacobian = new_jacobian;
                cost = new_cost;

                if gain_ratio > 0.75 {
                    trust_radius = (trust_radius * 2.0).min(max_radius);
                    lambda = (lambda / 3.0).max(MIN_DAMPING);
                } else if gain_ratio < 0.25 {
                    trust_radius *= 0.5;
                    lambda = (lambda * 2.0).min(MAX_DAMPING);
                }
            } else {
                trust_radius *= 0.25;
                lambda = (lambda * 10.0).max(MIN_DAMPING).min(MAX_DAMPING);

                if trust_radius <= tolerance {
                    // No productive step left at this scale
                    return Minimum { estimate, iterations: iteration + 1, converged: true };
                }
            }
        }

        Minimum {
            estimate,
            iterations: self.config.max_iterations,
            converged: false,
        }
    }
}

/// Damped Gauss-Newton step with the coordinates pinned on an active face held fixed
///
/// A coordinate is fixed when it lies on the cube and the step would carry it outward; the
/// reduced system is re-solved until no free coordinate pushes outward. `None` when the
/// system is not positive definite.
fn bounded_step(
    augmented: &Matrix3<f64>,
    gradient: &Vector3<f64>,
    estimate: &Vector3<f64>,
    bound: f64,
) -> Option<Vector3<f64>> {
    let mut fixed = [false; 3];
    loop {
        let mut system = *augmented;
        let mut rhs = -gradient;
        for i in (0..3).filter(|&i| fixed[i]) {
            for j in 0..3 {
                system[(i, j)] = 0.0;
                system[(j, i)] = 0.0;
            }
            system[(i, i)] = 1.0;
            rhs[i] = 0.0;
        }

        let step = system.cholesky()?.solve(&rhs);

        let mut changed = false;
        for i in 0..3 {
            if !fixed[i] && pushes_outward(estimate[i], step[i], bound) {
                fixed[i] = true;
                changed = true;
            }
        }
        if !changed {
            return Some(step);
        }
    }
}

/// Whether moving `coordinate` by `delta` leaves a face it already lies on
fn pushes_outward(coordinate: f64, delta: f64, bound: f64) -> bool {
    (coordinate >= bound && delta > 0.0) || (coordinate <= -bound && delta < 0.0)
}

/// Clamp each coordinate into `[-bound, bound]`
fn project(point: &Vector3<f64>, bound: f64) -> Vector3<f64> {
    point.map(|c| c.max(-bound).min(bound))
}

/// Residuals `||p - a_i|| - d_i` and their Jacobian with respect to `p`
fn compute_residuals_and_jacobian(
    positions: &[Vector3<f64>],
    ranges: &[f64],
    estimate: &Vector3<f64>,
) -> (DVector<f64>, DMatrix<f64>) {
    let n = positions.len();
    let mut residuals = DVector::zeros(n);
    let mut jacobian = DMatrix::zeros(n, 3);

    for i in 0..n {
        let diff = estimate - positions[i];
        let predicted_range = diff.norm();

        residuals[i] = predicted_range - ranges[i];

        // Gradient is undefined on top of an anchor; leave that row at zero
        if predicted_range > 1e-12 {
            let unit_vector = diff / predicted_range;
            jacobian[(i, 0)] = unit_vector.x;
            jacobian[(i, 1)] = unit_vector.y;
            jacobian[(i, 2)] = unit_vector.z;
        }
    }

    (residuals, jacobian)
}

/// Cost reduction predicted by the linear model: `||r||^2 - ||r + J s||^2`
fn compute_predicted_reduction(
    residuals: &DVector<f64>,
    jacobian: &DMatrix<f64>,
    step: &Vector3<f64>,
) -> f64 {
    let step_dv = DVector::from_column_slice(step.as_slice());
    let linear_term = jacobian * &step_dv;

    -2.0 * residuals.dot(&linear_term) - linear_term.dot(&linear_term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn room_anchors() -> AnchorSnapshot {
        let mut anchors = HashMap::new();
        anchors.insert("anchor-1".to_string(), Point3::new(0.0, 0.0, 2.5));
        anchors.insert("anchor-2".to_string(), Point3::new(20.0, 0.0, 2.5));
        anchors.insert("anchor-3".to_string(), Point3::new(0.0, 20.0, 2.5));
        anchors.insert("anchor-4".to_string(), Point3::new(20.0, 20.0, 3.0));
        AnchorSnapshot::new(anchors)
    }

    fn wide_anchors() -> AnchorSnapshot {
        let mut anchors = HashMap::new();
        anchors.insert("a".to_string(), Point3::new(0.0, 0.0, 0.0));
        anchors.insert("b".to_string(), Point3::new(30.0, 0.0, 5.0));
        anchors.insert("c".to_string(), Point3::new(0.0, 30.0, 10.0));
        anchors.insert("d".to_string(), Point3::new(30.0, 30.0, 0.0));
        anchors.insert("e".to_string(), Point3::new(15.0, -5.0, 12.0));
        anchors.insert("f".to_string(), Point3::new(-5.0, 15.0, 6.0));
        AnchorSnapshot::new(anchors)
    }

    fn exact_measurements(anchors: &AnchorSnapshot, ids: &[&str], tag: &Point3) -> Vec<Measurement> {
        ids.iter()
            .map(|id| {
                let anchor = anchors.get(id).unwrap();
                Measurement::new(*id, "tag-1", anchor.distance_to(tag))
            })
            .collect()
    }

    #[test]
    fn test_exact_ranges_recover_tag() {
        let anchors = room_anchors();
        let truth = Point3::new(10.0, 10.0, 1.0);
        let measurements =
            exact_measurements(&anchors, &["anchor-1", "anchor-2", "anchor-3", "anchor-4"], &truth);

        let engine = TrilaterationEngine::default();
        let solution = engine.solve(&measurements, &anchors, None).unwrap();

        assert!(solution.position.distance_to(&truth) < 1e-3, "got {:?}", solution.position);
        assert!(solution.accuracy < 1e-6);
        assert_eq!(solution.anchors_used, 4);
        assert_eq!(solution.residuals.len(), 4);
    }

    #[test]
    fn test_exact_ranges_at_several_points() {
        let anchors = wide_anchors();
        let ids = ["a", "b", "c", "d", "e", "f"];
        let engine = TrilaterationEngine::default();

        for truth in [
            Point3::new(5.0, 5.0, 3.0),
            Point3::new(22.0, 8.0, 1.5),
            Point3::new(14.0, 27.0, 7.0),
            Point3::new(-3.0, 12.0, 4.0),
        ] {
            let measurements = exact_measurements(&anchors, &ids, &truth);
            let solution = engine.solve(&measurements, &anchors, None).unwrap();

            assert!(
                solution.position.distance_to(&truth) < 1e-3,
                "truth {:?}, got {:?}",
                truth,
                solution.position
            );
            assert!(solution.accuracy < 1e-6);
            assert!(solution.converged);
        }
    }

    #[test]
    fn test_three_anchors_with_prior() {
        let mut map = HashMap::new();
        map.insert("a".to_string(), Point3::new(0.0, 0.0, 0.0));
        map.insert("b".to_string(), Point3::new(10.0, 0.0, 0.0));
        map.insert("c".to_string(), Point3::new(0.0, 10.0, 0.0));
        let anchors = AnchorSnapshot::new(map);
        let truth = Point3::new(3.0, 4.0, 5.0);
        let measurements = exact_measurements(&anchors, &["a", "b", "c"], &truth);

        let engine = TrilaterationEngine::default();
        let solution = engine
            .solve(&measurements, &anchors, Some(Point3::new(2.0, 2.0, 2.0)))
            .unwrap();

        assert!(solution.position.distance_to(&truth) < 1e-3, "got {:?}", solution.position);
        assert!(solution.accuracy < 1e-6);
    }

    #[test]
    fn test_fewer_than_three_measurements() {
        let anchors = room_anchors();
        let measurements = vec![
            Measurement::new("anchor-1", "tag-1", 5.0),
            Measurement::new("anchor-2", "tag-1", 7.0),
        ];

        let engine = TrilaterationEngine::default();
        let err = engine.solve(&measurements, &anchors, None).unwrap_err();

        assert_eq!(
            err,
            TrilaterationError::InsufficientMeasurements { usable: 2, required: 3 }
        );
    }

    #[test]
    fn test_unknown_anchors_do_not_count() {
        let anchors = room_anchors();
        let measurements = vec![
            Measurement::new("anchor-1", "tag-1", 5.0),
            Measurement::new("anchor-2", "tag-1", 7.0),
            Measurement::new("anchor-99", "tag-1", 6.0),
            Measurement::new("retired", "tag-1", 4.0),
        ];

        let engine = TrilaterationEngine::default();
        let err = engine.solve(&measurements, &anchors, None).unwrap_err();

        assert_eq!(
            err,
            TrilaterationError::InsufficientMeasurements { usable: 2, required: 3 }
        );
    }

    #[test]
    fn test_unknown_anchor_is_dropped_not_fatal() {
        let anchors = room_anchors();
        let truth = Point3::new(10.0, 10.0, 1.0);
        let mut measurements =
            exact_measurements(&anchors, &["anchor-1", "anchor-2", "anchor-3", "anchor-4"], &truth);
        measurements.push(Measurement::new("ghost", "tag-1", 123.0));

        let engine = TrilaterationEngine::default();
        let solution = engine.solve(&measurements, &anchors, None).unwrap();

        assert_eq!(solution.anchors_used, 4);
        assert!(solution.position.distance_to(&truth) < 1e-3);
    }

    #[test]
    fn test_nan_distance_diverges() {
        let anchors = room_anchors();
        let measurements = vec![
            Measurement::new("anchor-1", "tag-1", 5.0),
            Measurement::new("anchor-2", "tag-1", f64::NAN),
            Measurement::new("anchor-3", "tag-1", 6.0),
            Measurement::new("anchor-4", "tag-1", 8.0),
        ];

        let engine = TrilaterationEngine::default();
        let err = engine.solve(&measurements, &anchors, None).unwrap_err();

        assert!(matches!(err, TrilaterationError::SolverDivergence { .. }));
    }

    #[test]
    fn test_solution_stays_inside_search_cube() {
        let anchors = room_anchors();
        let truth = Point3::new(10.0, 10.0, 1.0);
        let measurements =
            exact_measurements(&anchors, &["anchor-1", "anchor-2", "anchor-3", "anchor-4"], &truth);

        let engine = TrilaterationEngine::new(SolverConfig {
            search_bound_m: 5.0,
            ..SolverConfig::default()
        });
        let solution = engine.solve(&measurements, &anchors, None).unwrap();

        for c in [solution.position.x, solution.position.y, solution.position.z] {
            assert!(c.abs() <= 5.0 + 1e-12);
        }
        // True point is outside the cube, so the fit cannot be exact
        assert!(solution.accuracy > 1.0);
    }

    #[test]
    fn test_bounded_fix_beats_grid_inside_cube() {
        let anchors = room_anchors();
        let ids = ["anchor-1", "anchor-2", "anchor-3", "anchor-4"];
        let truth = Point3::new(10.0, 10.0, 1.0);
        let measurements = exact_measurements(&anchors, &ids, &truth);
        let bound = 5.0;

        let engine = TrilaterationEngine::new(SolverConfig {
            search_bound_m: bound,
            ..SolverConfig::default()
        });
        let solution = engine.solve(&measurements, &anchors, None).unwrap();
        let solver_cost: f64 = solution.residuals.iter().map(|r| r * r).sum();

        let cost_at = |p: Point3| -> f64 {
            measurements
                .iter()
                .map(|m| {
                    let r = anchors.get(&m.anchor_id).unwrap().distance_to(&p) - m.distance_m;
                    r * r
                })
                .sum()
        };

        let steps = 40;
        let spacing = 2.0 * bound / steps as f64;
        let mut grid_best = f64::INFINITY;
        for i in 0..=steps {
            for j in 0..=steps {
                for k in 0..=steps {
                    let p = Point3::new(
                        -bound + i as f64 * spacing,
                        -bound + j as f64 * spacing,
                        -bound + k as f64 * spacing,
                    );
                    grid_best = grid_best.min(cost_at(p));
                }
            }
        }

        assert!(
            solver_cost <= grid_best + 1e-9,
            "solver cost {} at {:?}, grid best {}",
            solver_cost,
            solution.position,
            grid_best
        );
        assert!(solution.converged);
        // x and y stay pinned on the faces nearest the tag
        assert!((solution.position.x - bound).abs() < 1e-9);
        assert!((solution.position.y - bound).abs() < 1e-9);
    }

    #[test]
    fn test_initial_guess_outside_cube_is_projected() {
        let anchors = room_anchors();
        let truth = Point3::new(10.0, 10.0, 1.0);
        let measurements =
            exact_measurements(&anchors, &["anchor-1", "anchor-2", "anchor-3", "anchor-4"], &truth);

        let engine = TrilaterationEngine::default();
        let solution = engine
            .solve(&measurements, &anchors, Some(Point3::new(500.0, -500.0, 0.0)))
            .unwrap();

        assert!(solution.position.is_finite());
        assert!(solution.position.x.abs() <= 100.0 && solution.position.y.abs() <= 100.0);
    }

    #[test]
    fn test_deterministic_for_identical_inputs() {
        let anchors = wide_anchors();
        let measurements = vec![
            Measurement::new("a", "t", 11.2),
            Measurement::new("b", "t", 21.9),
            Measurement::new("c", "t", 23.4),
            Measurement::new("d", "t", 30.1),
            Measurement::new("e", "t", 14.8),
        ];

        let engine = TrilaterationEngine::default();
        let first = engine.solve(&measurements, &anchors, None).unwrap();
        let second = engine.solve(&measurements, &anchors, None).unwrap();

        assert!(first.position.distance_to(&second.position) < 1e-9);
        assert!((first.accuracy - second.accuracy).abs() < 1e-9);
    }

    #[test]
    fn test_accuracy_grows_with_noise() {
        let anchors = wide_anchors();
        let ids = ["a", "b", "c", "d", "e", "f"];
        let truth = Point3::new(12.0, 14.0, 4.0);
        let engine = TrilaterationEngine::default();
        let mut rng = StdRng::seed_from_u64(7);

        let mut mean_accuracy = Vec::new();
        for amplitude in [0.05, 0.2, 0.8] {
            let trials = 60;
            let mut total = 0.0;
            for _ in 0..trials {
                let measurements: Vec<Measurement> = ids
                    .iter()
                    .map(|id| {
                        let range = anchors.get(id).unwrap().distance_to(&truth);
                        let noise = rng.gen_range(-amplitude..amplitude);
                        Measurement::new(*id, "tag-1", range + noise)
                    })
                    .collect();
                total += engine.solve(&measurements, &anchors, None).unwrap().accuracy;
            }
            mean_accuracy.push(total / trials as f64);
        }

        assert!(mean_accuracy[0] < mean_accuracy[1], "{:?}", mean_accuracy);
        assert!(mean_accuracy[1] < mean_accuracy[2], "{:?}", mean_accuracy);
    }

    #[test]
    fn test_iteration_cap_still_returns_point() {
        let anchors = wide_anchors();
        let truth = Point3::new(12.0, 14.0, 4.0);
        let measurements = exact_measurements(&anchors, &["a", "b", "c", "d"], &truth);

        let engine = TrilaterationEngine::new(SolverConfig {
            max_iterations: 1,
            ..SolverConfig::default()
        });
        let solution = engine.solve(&measurements, &anchors, None).unwrap();

        assert!(!solution.converged);
        assert_eq!(solution.iterations, 1);
        assert!(solution.position.is_finite());
    }
}
