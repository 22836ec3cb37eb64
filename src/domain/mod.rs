// Domain layer: entities, condition trees, schedules, the status machine and
// the ports the engine talks to. No I/O happens here.

pub mod conditions;
pub mod model;
pub mod ports;
pub mod schedule;
pub mod status;
