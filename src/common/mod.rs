pub(crate) mod rewind;
