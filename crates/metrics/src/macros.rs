/// Register an integer counter with the IndexPilot registry and store it in a
/// static. The reported name is `indexpilot_` + the lower_snake_case variable
/// name. An optional third argument declares label names, which switches the
/// stored type to a `IntCounterVec`.
#[macro_export]
macro_rules! register_pilot_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_int_counter_with_registry!(
                    name,
                    $HELP,
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_int_counter_vec_with_registry!(
                    name,
                    $HELP,
                    $LABELS,
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
}

/// Register a floating-point gauge, optionally labeled. Same naming scheme as
/// [`register_pilot_counter`].
#[macro_export]
macro_rules! register_pilot_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_gauge_with_registry!(
                    name,
                    $HELP,
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::GaugeVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_gauge_vec_with_registry!(
                    name,
                    $HELP,
                    $LABELS,
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
}

/// Register a histogram. The second form labels every sample with a `status`
/// dimension and pairs with [`crate::StatusTimer`].
#[macro_export]
macro_rules! register_pilot_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_histogram_with_registry!(
                    name,
                    $HELP,
                    $crate::latency_buckets(),
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = concat!("indexpilot_", stringify!([<$NAME:lower>]));
                }
                $crate::prometheus::register_histogram_vec_with_registry!(
                    name,
                    $HELP,
                    $LABELS,
                    $crate::latency_buckets(),
                    &*$crate::PILOT_METRICS_REGISTRY,
                )
                .expect("metric initialization failed")
            });
    };
}
