pub(crate) mod workers;
