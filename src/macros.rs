//! Logging facade.
//!
//! Forwards to `log` and/or `defmt` depending on the enabled features. With
//! neither enabled the arguments are still type-checked but nothing is emitted.
//! Format strings must stick to `{}` / `{:?}` so both backends accept them.

macro_rules! trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($arg)*);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::trace!($($arg)*);
        let _ = ::core::format_args!($($arg)*);
    }};
}

macro_rules! debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($arg)*);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::debug!($($arg)*);
        let _ = ::core::format_args!($($arg)*);
    }};
}

macro_rules! info {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::info!($($arg)*);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::info!($($arg)*);
        let _ = ::core::format_args!($($arg)*);
    }};
}

macro_rules! warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($arg)*);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::warn!($($arg)*);
        let _ = ::core::format_args!($($arg)*);
    }};
}

macro_rules! error {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::error!($($arg)*);
        #[cfg(feature = "defmt-0-3")]
        ::defmt::error!($($arg)*);
        let _ = ::core::format_args!($($arg)*);
    }};
}
