//! Observation models: sensors, measurement noise and mounting poses.
//!
//! A [`SensorModel`] binds together the three numeric dimensions of an RBA
//! problem — the relative-pose DOF (via its `Pose` type), the landmark
//! dimension `LM_DIMS` and the observation dimension `OBS_DIMS` — and
//! provides the projection `h` together with its derivative with respect to
//! the observed point. Everything downstream (residuals, block Jacobians,
//! Hessians) is written against this trait; adding a sensor means
//! implementing two functions.
//!
//! The observation pipeline for a landmark `f` expressed in its base
//! keyframe is
//!
//! ```text
//! h( S^-1 · T(obs ← base) · f )
//! ```
//!
//! where `S` is the optional fixed sensor-on-robot mounting pose (identity
//! when absent) and `T(obs ← base)` is the composed relative pose read from
//! the spanning trees.

use crate::manifold::RelativePose;
use nalgebra::{DMatrix, DVector};

pub mod cartesian;
pub mod range_bearing;

pub use cartesian::Cartesian3D;
pub use range_bearing::RangeBearing2D;

/// A sensor model: projection of a point in the sensor frame into an
/// observation vector, plus the analytic derivative of that projection.
///
/// Landmarks are Euclidean points of dimension `Pose::DIM`; `LM_DIMS` is
/// kept as its own associated constant so container code never reaches
/// through the pose type.
pub trait SensorModel: 'static {
    /// The relative-pose parameterization of the keyframe graph.
    type Pose: RelativePose;

    /// Dimension of a landmark position (relative to its base keyframe).
    const LM_DIMS: usize;

    /// Dimension of one observation vector.
    const OBS_DIMS: usize;

    /// Sensor-specific calibration parameters.
    type Params: Clone + Default + Send + Sync;

    /// Project a point expressed in the sensor frame into an observation.
    fn project_point(point: &DVector<f64>, params: &Self::Params) -> DVector<f64>;

    /// Derivative of [`SensorModel::project_point`] with respect to the
    /// point, an `OBS_DIMS x LM_DIMS` matrix.
    fn point_jacobian(point: &DVector<f64>, params: &Self::Params) -> DMatrix<f64>;

    /// Predicted observation of landmark `lm` (in base-keyframe
    /// coordinates) through the relative pose `T(obs ← base)` and an
    /// optional sensor mounting pose.
    fn predict(
        pose: &Self::Pose,
        lm: &DVector<f64>,
        sensor_pose: Option<&Self::Pose>,
        params: &Self::Params,
    ) -> DVector<f64> {
        let in_robot = pose.transform_point(lm);
        let in_sensor = match sensor_pose {
            Some(s) => s.inverse().transform_point(&in_robot),
            None => in_robot,
        };
        Self::project_point(&in_sensor, params)
    }

    /// Analytic Jacobians of the prediction with respect to a right
    /// perturbation of `pose` (`OBS_DIMS x DOF`) and to the landmark
    /// position (`OBS_DIMS x LM_DIMS`).
    fn jacobians(
        pose: &Self::Pose,
        lm: &DVector<f64>,
        sensor_pose: Option<&Self::Pose>,
        params: &Self::Params,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let in_robot = pose.transform_point(lm);
        let (in_sensor, rot_sensor_inv) = match sensor_pose {
            Some(s) => {
                let s_inv = s.inverse();
                (s_inv.transform_point(&in_robot), s_inv.rotation())
            }
            None => (
                in_robot,
                DMatrix::identity(Self::Pose::DIM, Self::Pose::DIM),
            ),
        };
        // dh/dx at the predicted point, with the mounting rotation folded in
        let j_obs = Self::point_jacobian(&in_sensor, params) * rot_sensor_inv;
        let rot = pose.rotation();
        let dh_dpose = &j_obs * &rot * Self::Pose::point_action_jacobian(lm);
        let dh_dlm = j_obs * rot;
        (dh_dpose, dh_dlm)
    }
}

/// Per-observation information weight applied to residuals and Jacobians.
#[derive(Debug, Clone)]
pub enum NoiseWeight {
    /// Unit information matrix.
    Identity,
    /// Information matrix `w * I`.
    Scalar(f64),
    /// Full `OBS_DIMS x OBS_DIMS` information matrix.
    Matrix(DMatrix<f64>),
}

impl NoiseWeight {
    /// Weighted squared norm `r^T Λ r`.
    pub fn squared_norm(&self, r: &DVector<f64>) -> f64 {
        match self {
            NoiseWeight::Identity => r.dot(r),
            NoiseWeight::Scalar(w) => w * r.dot(r),
            NoiseWeight::Matrix(m) => r.dot(&(m * r)),
        }
    }

    /// `Λ v`.
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            NoiseWeight::Identity => v.clone(),
            NoiseWeight::Scalar(w) => v * *w,
            NoiseWeight::Matrix(m) => m * v,
        }
    }

    /// `Λ J` for a block Jacobian.
    pub fn apply_matrix(&self, j: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            NoiseWeight::Identity => j.clone(),
            NoiseWeight::Scalar(w) => j * *w,
            NoiseWeight::Matrix(m) => m * j,
        }
    }

    /// Fold an extra scalar factor into the weight (robust kernel
    /// reweighting).
    pub fn scaled(&self, factor: f64) -> NoiseWeight {
        match self {
            NoiseWeight::Identity => NoiseWeight::Scalar(factor),
            NoiseWeight::Scalar(w) => NoiseWeight::Scalar(w * factor),
            NoiseWeight::Matrix(m) => NoiseWeight::Matrix(m * factor),
        }
    }
}

/// Supplies the information weight for each observation.
pub trait ObservationNoise: Send + Sync {
    /// Information weight of the observation with the given global index.
    fn information(&self, obs_idx: usize) -> NoiseWeight;
}

/// Identity noise model: every observation has information `I / sigma^2`.
#[derive(Debug, Clone)]
pub struct IdentityNoise {
    /// Standard deviation of each observation component.
    pub sigma: f64,
}

impl Default for IdentityNoise {
    fn default() -> Self {
        IdentityNoise { sigma: 1.0 }
    }
}

impl ObservationNoise for IdentityNoise {
    fn information(&self, _obs_idx: usize) -> NoiseWeight {
        if self.sigma == 1.0 {
            NoiseWeight::Identity
        } else {
            NoiseWeight::Scalar(1.0 / (self.sigma * self.sigma))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::SE2;

    #[test]
    fn test_noise_weight_scalar() {
        let w = NoiseWeight::Scalar(4.0);
        let r = DVector::from_vec(vec![1.0, 2.0]);
        assert!((w.squared_norm(&r) - 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_identity_noise_default_is_identity() {
        let n = IdentityNoise::default();
        assert!(matches!(n.information(0), NoiseWeight::Identity));
        let n = IdentityNoise { sigma: 2.0 };
        match n.information(3) {
            NoiseWeight::Scalar(w) => assert!((w - 0.25).abs() < 1e-12),
            _ => panic!("expected scalar weight"),
        }
    }

    #[test]
    fn test_sensor_jacobians_match_finite_differences() {
        let pose = SE2::from_xy_angle(0.4, -0.2, 0.3);
        let lm = DVector::from_vec(vec![2.0, 1.0]);
        let params = <RangeBearing2D as SensorModel>::Params::default();
        let mount = Some(SE2::from_xy_angle(0.1, 0.05, 0.02));

        let (dh_dp, dh_df) = RangeBearing2D::jacobians(&pose, &lm, mount.as_ref(), &params);

        let eps = 1e-7;
        for d in 0..3 {
            let mut delta = DVector::zeros(3);
            delta[d] = eps;
            let plus = RangeBearing2D::predict(
                &pose.compose(&SE2::exp(&delta)),
                &lm,
                mount.as_ref(),
                &params,
            );
            delta[d] = -eps;
            let minus = RangeBearing2D::predict(
                &pose.compose(&SE2::exp(&delta)),
                &lm,
                mount.as_ref(),
                &params,
            );
            let fd = (plus - minus) / (2.0 * eps);
            for r in 0..2 {
                assert!((dh_dp[(r, d)] - fd[r]).abs() < 1e-6);
            }
        }
        for d in 0..2 {
            let mut lm_p = lm.clone();
            lm_p[d] += eps;
            let plus = RangeBearing2D::predict(&pose, &lm_p, mount.as_ref(), &params);
            lm_p[d] -= 2.0 * eps;
            let minus = RangeBearing2D::predict(&pose, &lm_p, mount.as_ref(), &params);
            let fd = (plus - minus) / (2.0 * eps);
            for r in 0..2 {
                assert!((dh_df[(r, d)] - fd[r]).abs() < 1e-6);
            }
        }
    }
}
