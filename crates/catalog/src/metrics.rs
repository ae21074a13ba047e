use metrics::{
    log_gauge,
    register_pilot_gauge,
};

register_pilot_gauge!(CATALOG_ENTRIES, "Catalog entries currently tracked");

pub(crate) fn log_catalog_size(entries: usize) {
    log_gauge(&CATALOG_ENTRIES, entries as f64);
}
