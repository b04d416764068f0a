//! 3-D Cartesian sensor for SE(3) problems.

use crate::manifold::SE3;
use crate::models::SensorModel;
use nalgebra::{DMatrix, DVector};

/// Direct Cartesian observations of 3-D point landmarks from SE(3)
/// keyframes: the observation is the landmark position in the sensor
/// frame, `h(x) = x`. Useful for RGB-D style sensors and as the simplest
/// full-rank 3-D model for testing.
pub struct Cartesian3D;

/// Calibration parameters of the Cartesian sensor (none).
#[derive(Debug, Clone, Default)]
pub struct CartesianParams;

impl SensorModel for Cartesian3D {
    type Pose = SE3;
    const LM_DIMS: usize = 3;
    const OBS_DIMS: usize = 3;
    type Params = CartesianParams;

    fn project_point(point: &DVector<f64>, _params: &Self::Params) -> DVector<f64> {
        point.clone()
    }

    fn point_jacobian(_point: &DVector<f64>, _params: &Self::Params) -> DMatrix<f64> {
        DMatrix::identity(3, 3)
    }
}
