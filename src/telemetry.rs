//! Telemetry records carried by heartbeats, and the store that supplies them.
//!
//! The telemetry store is owned by the data-handling subsystem; the session only
//! asks it for the latest reading of a topic right before building a heartbeat.

/// Telemetry topics the session reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Topic {
    /// Power monitor (battery state of charge, current).
    Monitor,
    /// Sun vector estimate.
    Sun,
    /// Magnetometer and gyroscope.
    Imu,
    /// GPS fix in ECEF.
    Gps,
    /// Payload (Jetson) health.
    Jetson,
}

/// Latest power-monitor reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct BatteryReading {
    /// State of charge, percent.
    pub soc: u8,
    /// Battery current, raw 16-bit ADC units.
    pub current: u16,
    /// Boot counter.
    pub reboot_count: u8,
    /// Seconds since epoch.
    pub time: u32,
}

/// Latest sun-vector estimate (unit vector, body frame).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct SunReading {
    /// Sun vector components.
    pub vector: [f32; 3],
    /// Seconds since epoch.
    pub time: u32,
}

/// Latest IMU sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct ImuReading {
    /// Magnetic field, x/y/z.
    pub mag: [f32; 3],
    /// Angular rate, x/y/z.
    pub gyro: [f32; 3],
    /// Seconds since epoch.
    pub time: u32,
}

/// Latest GPS solution, ECEF.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct GpsReading {
    /// Position x/y/z.
    pub position: [f32; 3],
    /// Position standard deviation x/y/z.
    pub position_sd: [f32; 3],
    /// Velocity x/y/z.
    pub velocity: [f32; 3],
    /// Velocity standard deviation x/y/z.
    pub velocity_sd: [f32; 3],
    /// Seconds since epoch.
    pub time: u32,
}

/// Latest payload computer health report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub struct JetsonReading {
    /// RAM usage, percent.
    pub ram_percent: u8,
    /// Disk usage, percent.
    pub disk_percent: u8,
    /// CPU temperature, °C.
    pub cpu_temp: u8,
    /// GPU temperature, °C.
    pub gpu_temp: u8,
    /// Seconds since epoch.
    pub time: u32,
}

/// A reading returned by [`TelemetryStore::latest_reading`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-0-3", derive(defmt::Format))]
pub enum Reading {
    /// See [`BatteryReading`].
    Battery(BatteryReading),
    /// See [`SunReading`].
    Sun(SunReading),
    /// See [`ImuReading`].
    Imu(ImuReading),
    /// See [`GpsReading`].
    Gps(GpsReading),
    /// See [`JetsonReading`].
    Jetson(JetsonReading),
}

/// Read access to the onboard telemetry store.
pub trait TelemetryStore {
    /// Returns the most recent record for `topic`, or `None` if nothing has been logged yet.
    fn latest_reading(&mut self, topic: Topic) -> Option<Reading>;

    /// 16-bit system status word prepended to every heartbeat.
    fn system_status(&mut self) -> u16 {
        0
    }
}
