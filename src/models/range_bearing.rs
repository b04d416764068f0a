//! 2-D range-bearing sensor for SE(2) problems.

use crate::manifold::SE2;
use crate::models::SensorModel;
use nalgebra::{DMatrix, DVector};

/// Range-bearing observations of 2-D point landmarks from SE(2) keyframes.
///
/// An observation is `[range, bearing]` of the landmark in the sensor
/// frame: `range = sqrt(x^2 + y^2)`, `bearing = atan2(y, x)`. The point
/// Jacobian is singular at the sensor origin; observations of a landmark
/// coincident with the sensor are not meaningful for this model.
pub struct RangeBearing2D;

/// Calibration parameters of the range-bearing sensor. The ideal sensor
/// has none; the struct exists so sensor-specific options keep a uniform
/// shape across models.
#[derive(Debug, Clone, Default)]
pub struct RangeBearingParams;

impl SensorModel for RangeBearing2D {
    type Pose = SE2;
    const LM_DIMS: usize = 2;
    const OBS_DIMS: usize = 2;
    type Params = RangeBearingParams;

    fn project_point(point: &DVector<f64>, _params: &Self::Params) -> DVector<f64> {
        let (x, y) = (point[0], point[1]);
        DVector::from_vec(vec![(x * x + y * y).sqrt(), y.atan2(x)])
    }

    fn point_jacobian(point: &DVector<f64>, _params: &Self::Params) -> DMatrix<f64> {
        let (x, y) = (point[0], point[1]);
        let r2 = x * x + y * y;
        let r = r2.sqrt();
        let mut jac = DMatrix::zeros(2, 2);
        jac[(0, 0)] = x / r;
        jac[(0, 1)] = y / r;
        jac[(1, 0)] = -y / r2;
        jac[(1, 1)] = x / r2;
        jac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bearing_projection() {
        let p = DVector::from_vec(vec![3.0, 4.0]);
        let z = RangeBearing2D::project_point(&p, &RangeBearingParams);
        assert!((z[0] - 5.0).abs() < 1e-12);
        assert!((z[1] - (4.0f64).atan2(3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_range_bearing_point_jacobian() {
        let p = DVector::from_vec(vec![1.0, 2.0]);
        let jac = RangeBearing2D::point_jacobian(&p, &RangeBearingParams);
        let eps = 1e-7;
        for d in 0..2 {
            let mut pp = p.clone();
            pp[d] += eps;
            let plus = RangeBearing2D::project_point(&pp, &RangeBearingParams);
            pp[d] -= 2.0 * eps;
            let minus = RangeBearing2D::project_point(&pp, &RangeBearingParams);
            let fd = (plus - minus) / (2.0 * eps);
            for r in 0..2 {
                assert!((jac[(r, d)] - fd[r]).abs() < 1e-6);
            }
        }
    }
}
