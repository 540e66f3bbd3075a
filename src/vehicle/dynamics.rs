/// Advances a longitudinal state by one time step under constant acceleration.
///
/// Returns the new `(pos, vel)`; the velocity is clamped to `[0, max_vel]`.
/// A vehicle which comes to a halt during the step stops there rather than reversing.
pub fn integrate(pos: f64, vel: f64, acc: f64, dt: f64, max_vel: f64) -> (f64, f64) {
    let new_vel = vel + acc * dt;
    if new_vel < 0.0 {
        // Only reachable with `acc < 0`
        let stopping_dist = vel * vel / (-2.0 * acc);
        return (pos + stopping_dist, 0.0);
    }
    let new_pos = pos + vel * dt + 0.5 * acc * dt * dt;
    (new_pos, f64::min(new_vel, max_vel))
}
