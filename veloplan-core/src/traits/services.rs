//! Cooperative host services
//!
//! The planner's only suspension point is the full-buffer wait inside a
//! submission. While spinning there it must keep servicing the rest of
//! the machine; it also consults the hotend temperature for the
//! cold-extrusion interlock.

/// Services run between retests of the full-buffer wait
///
/// Implementations typically service heaters, the inactivity watchdog
/// and the display. `poll` is called repeatedly and must not block.
pub trait IdleServices {
    fn poll(&mut self);
}

/// Hotend temperature readout for the extrusion interlock
pub trait HotendMonitor {
    /// Current hotend temperature of the given extruder (°C)
    fn hotend_celsius(&mut self, extruder: u8) -> f32;
}
