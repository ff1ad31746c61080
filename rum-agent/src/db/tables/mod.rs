pub mod buffered_spans;
