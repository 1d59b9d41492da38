//! Angle wrapping and rigid-transform algebra with first-order covariance propagation.
//!
//! Two transform parameterizations are provided:
//!
//! - [`Pose2`]: a planar (3-DOF) transform $(x, y, \theta)$.
//! - [`Pose3`]: a spatial (6-DOF) transform $(x, y, z, \phi, \theta, \psi)$ using roll, pitch and yaw
//!   with the rotation $R = R_z(\psi) R_y(\theta) R_x(\phi)$.
//!
//! Both implement [`RigidTransform`], which offers composition with another transform, composition
//! with a bare point and inversion. Each operation optionally propagates uncertainty:
//!
//! $$
//! P_r = J_a P_a J_a^T + J_b P_b J_b^T
//! $$
//!
//! where $J_a$ and $J_b$ are the analytic Jacobians of the composition evaluated at the inputs. When
//! either covariance is omitted the returned covariance is `None`; uncertainty is simply not tracked
//! for that call.
//!
//! The spatial inverse negates the Euler angles component-wise and rotates the translation by
//! $R(-\phi, -\theta, -\psi)$. This is the exact inverse of [`Pose3::compose`] as defined here
//! (`a.inverse().compose(&a)` is the identity) but it is not a general SE(3) inverse, since
//! orientations compose by angle addition.
use std::f64::consts::PI;
use std::fmt::{self, Display};

use nalgebra::{
    Matrix2, Matrix2x3, Matrix3, Matrix3x6, Matrix6, Point2, Point3, Rotation3, SMatrix, Vector3,
    Vector6,
};
use serde::{Deserialize, Serialize};

/// Wrap an angle in radians into the half-open interval $(-\pi, \pi]$.
///
/// The result is idempotent: `normalize_angle(normalize_angle(a)) == normalize_angle(a)` exactly,
/// because values already inside the interval pass through `%` unchanged. Non-finite input yields NaN.
///
/// # Example
/// ```rust
/// use odometry::frames::normalize_angle;
/// use std::f64::consts::PI;
/// assert_eq!(normalize_angle(-PI), PI);
/// assert_eq!(normalize_angle(0.0), 0.0);
/// ```
pub fn normalize_angle(angle: f64) -> f64 {
    let two_pi = 2.0 * PI;
    let wrapped = angle % two_pi;
    if wrapped > PI {
        wrapped - two_pi
    } else if wrapped <= -PI {
        wrapped + two_pi
    } else {
        wrapped
    }
}

/// Rotation matrix $R = R_z(\psi) R_y(\theta) R_x(\phi)$ for roll $\phi$, pitch $\theta$, yaw $\psi$.
pub fn rotation_rpy(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    Rotation3::from_euler_angles(roll, pitch, yaw).into_inner()
}

/// Partial derivatives of [`rotation_rpy`] with respect to roll, pitch and yaw, in that order.
pub fn rotation_rpy_partials(roll: f64, pitch: f64, yaw: f64) -> [Matrix3<f64>; 3] {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();

    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cr, -sr, 0.0, sr, cr);
    let ry = Matrix3::new(cp, 0.0, sp, 0.0, 1.0, 0.0, -sp, 0.0, cp);
    let rz = Matrix3::new(cy, -sy, 0.0, sy, cy, 0.0, 0.0, 0.0, 1.0);

    let drx = Matrix3::new(0.0, 0.0, 0.0, 0.0, -sr, -cr, 0.0, cr, -sr);
    let dry = Matrix3::new(-sp, 0.0, cp, 0.0, 0.0, 0.0, -cp, 0.0, -sp);
    let drz = Matrix3::new(-sy, -cy, 0.0, cy, -sy, 0.0, 0.0, 0.0, 0.0);

    [rz * ry * drx, rz * dry * rx, drz * ry * rx]
}

/// Common interface of the planar and spatial rigid transforms.
pub trait RigidTransform: Sized + Copy {
    /// Covariance over the full transform parameters.
    type Covariance;
    /// Bare position without orientation.
    type Point;
    /// Covariance over a bare position.
    type PointCovariance;

    /// The transform that maps every frame onto itself.
    fn identity() -> Self;

    /// Express `b`, given relative to `self`, in the parent frame of `self`.
    fn compose(
        &self,
        b: &Self,
        pa: Option<&Self::Covariance>,
        pb: Option<&Self::Covariance>,
    ) -> (Self, Option<Self::Covariance>);

    /// Express a bare point, given relative to `self`, in the parent frame of `self`.
    fn compose_point(
        &self,
        b: &Self::Point,
        pa: Option<&Self::Covariance>,
        pb: Option<&Self::PointCovariance>,
    ) -> (Self::Point, Option<Self::PointCovariance>);

    /// Rigid inverse such that `self.inverse().compose(self)` is the identity.
    fn inverse(&self, pa: Option<&Self::Covariance>) -> (Self, Option<Self::Covariance>);
}

/// Planar rigid transform $(x, y, \theta)$.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Display for Pose2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pose2(x: {:.4}, y: {:.4}, theta: {:.4})", self.x, self.y, self.theta)
    }
}

impl From<[f64; 3]> for Pose2 {
    fn from(v: [f64; 3]) -> Self {
        Pose2::new(v[0], v[1], v[2])
    }
}

impl From<Pose2> for Vector3<f64> {
    fn from(p: Pose2) -> Self {
        Vector3::new(p.x, p.y, p.theta)
    }
}

impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2 { x, y, theta }
    }

    /// Jacobians of `self ⊕ b` with respect to `self` and to `b`.
    pub fn compose_jacobians(&self, b: &Pose2) -> (Matrix3<f64>, Matrix3<f64>) {
        let (st, ct) = self.theta.sin_cos();
        let ja = Matrix3::new(
            1.0,
            0.0,
            -b.x * st - b.y * ct,
            0.0,
            1.0,
            b.x * ct - b.y * st,
            0.0,
            0.0,
            1.0,
        );
        let jb = Matrix3::new(ct, -st, 0.0, st, ct, 0.0, 0.0, 0.0, 1.0);
        (ja, jb)
    }

    fn rotate(&self, bx: f64, by: f64) -> (f64, f64) {
        let (st, ct) = self.theta.sin_cos();
        (bx * ct - by * st + self.x, bx * st + by * ct + self.y)
    }
}

impl RigidTransform for Pose2 {
    type Covariance = Matrix3<f64>;
    type Point = Point2<f64>;
    type PointCovariance = Matrix2<f64>;

    fn identity() -> Self {
        Pose2::default()
    }

    fn compose(
        &self,
        b: &Pose2,
        pa: Option<&Matrix3<f64>>,
        pb: Option<&Matrix3<f64>>,
    ) -> (Pose2, Option<Matrix3<f64>>) {
        let (x, y) = self.rotate(b.x, b.y);
        let r = Pose2::new(x, y, normalize_angle(self.theta + b.theta));
        let p = match (pa, pb) {
            (Some(pa), Some(pb)) => {
                let (ja, jb) = self.compose_jacobians(b);
                Some(symmetric(ja * pa * ja.transpose() + jb * pb * jb.transpose()))
            }
            _ => None,
        };
        (r, p)
    }

    fn compose_point(
        &self,
        b: &Point2<f64>,
        pa: Option<&Matrix3<f64>>,
        pb: Option<&Matrix2<f64>>,
    ) -> (Point2<f64>, Option<Matrix2<f64>>) {
        let (x, y) = self.rotate(b.x, b.y);
        let p = match (pa, pb) {
            (Some(pa), Some(pb)) => {
                let (ja, jb) = self.compose_jacobians(&Pose2::new(b.x, b.y, 0.0));
                let ja: Matrix2x3<f64> = ja.fixed_view::<2, 3>(0, 0).into_owned();
                let jb: Matrix2<f64> = jb.fixed_view::<2, 2>(0, 0).into_owned();
                Some(symmetric(ja * pa * ja.transpose() + jb * pb * jb.transpose()))
            }
            _ => None,
        };
        (Point2::new(x, y), p)
    }

    fn inverse(&self, pa: Option<&Matrix3<f64>>) -> (Pose2, Option<Matrix3<f64>>) {
        let (st, ct) = self.theta.sin_cos();
        // Angle is negated, not wrapped: inv([1, 1, π]) = [1, 1, -π].
        let r = Pose2::new(
            -self.x * ct - self.y * st,
            self.x * st - self.y * ct,
            -self.theta,
        );
        let p = pa.map(|pa| {
            let ja = Matrix3::new(
                -ct,
                -st,
                self.x * st - self.y * ct,
                st,
                -ct,
                self.x * ct + self.y * st,
                0.0,
                0.0,
                -1.0,
            );
            symmetric(ja * pa * ja.transpose())
        });
        (r, p)
    }
}

/// Spatial rigid transform with roll-pitch-yaw orientation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Display for Pose3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pose3(x: {:.4}, y: {:.4}, z: {:.4}, roll: {:.4}, pitch: {:.4}, yaw: {:.4})",
            self.x, self.y, self.z, self.roll, self.pitch, self.yaw
        )
    }
}

impl From<[f64; 6]> for Pose3 {
    fn from(v: [f64; 6]) -> Self {
        Pose3::new(v[0], v[1], v[2], v[3], v[4], v[5])
    }
}

impl From<Pose3> for Vector6<f64> {
    fn from(p: Pose3) -> Self {
        Vector6::new(p.x, p.y, p.z, p.roll, p.pitch, p.yaw)
    }
}

impl Pose3 {
    pub fn new(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Pose3 {
            x,
            y,
            z,
            roll,
            pitch,
            yaw,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn angles(&self) -> Vector3<f64> {
        Vector3::new(self.roll, self.pitch, self.yaw)
    }

    /// Rotation from the frame described by this transform into its parent.
    pub fn rotation(&self) -> Matrix3<f64> {
        rotation_rpy(self.roll, self.pitch, self.yaw)
    }

    /// Jacobians of `self ⊕ b` with respect to `self` and to `b` (6×6 each).
    ///
    /// Only the translation part of `b` enters `J_a`, so a point composition uses the top three
    /// rows of `J_a` and the upper-left 3×3 block of `J_b`.
    pub fn compose_jacobians(&self, b: &Vector3<f64>) -> (Matrix6<f64>, Matrix6<f64>) {
        let partials = rotation_rpy_partials(self.roll, self.pitch, self.yaw);
        let mut ja = Matrix6::identity();
        for (k, d) in partials.iter().enumerate() {
            ja.fixed_view_mut::<3, 1>(0, 3 + k).copy_from(&(d * b));
        }
        let mut jb = Matrix6::identity();
        jb.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation());
        (ja, jb)
    }
}

impl RigidTransform for Pose3 {
    type Covariance = Matrix6<f64>;
    type Point = Point3<f64>;
    type PointCovariance = Matrix3<f64>;

    fn identity() -> Self {
        Pose3::default()
    }

    fn compose(
        &self,
        b: &Pose3,
        pa: Option<&Matrix6<f64>>,
        pb: Option<&Matrix6<f64>>,
    ) -> (Pose3, Option<Matrix6<f64>>) {
        let t = self.rotation() * b.position() + self.position();
        let angles = (self.angles() + b.angles()).map(normalize_angle);
        let r = Pose3::new(t.x, t.y, t.z, angles.x, angles.y, angles.z);
        let p = match (pa, pb) {
            (Some(pa), Some(pb)) => {
                let (ja, jb) = self.compose_jacobians(&b.position());
                Some(symmetric(ja * pa * ja.transpose() + jb * pb * jb.transpose()))
            }
            _ => None,
        };
        (r, p)
    }

    fn compose_point(
        &self,
        b: &Point3<f64>,
        pa: Option<&Matrix6<f64>>,
        pb: Option<&Matrix3<f64>>,
    ) -> (Point3<f64>, Option<Matrix3<f64>>) {
        let t = self.rotation() * b.coords + self.position();
        let p = match (pa, pb) {
            (Some(pa), Some(pb)) => {
                let (ja, jb) = self.compose_jacobians(&b.coords);
                let ja: Matrix3x6<f64> = ja.fixed_view::<3, 6>(0, 0).into_owned();
                let jb: Matrix3<f64> = jb.fixed_view::<3, 3>(0, 0).into_owned();
                Some(symmetric(ja * pa * ja.transpose() + jb * pb * jb.transpose()))
            }
            _ => None,
        };
        (Point3::from(t), p)
    }

    fn inverse(&self, pa: Option<&Matrix6<f64>>) -> (Pose3, Option<Matrix6<f64>>) {
        let (roll, pitch, yaw) = (-self.roll, -self.pitch, -self.yaw);
        let m = rotation_rpy(roll, pitch, yaw);
        let t = -(m * self.position());
        let r = Pose3::new(t.x, t.y, t.z, roll, pitch, yaw);
        let p = pa.map(|pa| {
            let partials = rotation_rpy_partials(roll, pitch, yaw);
            let mut ja = -Matrix6::<f64>::identity();
            ja.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-m));
            for (k, d) in partials.iter().enumerate() {
                ja.fixed_view_mut::<3, 1>(0, 3 + k)
                    .copy_from(&(d * self.position()));
            }
            symmetric(ja * pa * ja.transpose())
        });
        (r, p)
    }
}

#[inline]
fn symmetric<const N: usize>(m: SMatrix<f64, N, N>) -> SMatrix<f64, N, N> {
    0.5 * (m + m.transpose())
}
