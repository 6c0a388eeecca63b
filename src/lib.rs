// lib.rs
pub mod annotation;
pub mod cigar;
pub mod compound;
pub mod decompose;
pub mod ingest;
pub mod ledger;
pub mod reference;
pub mod seqidx;
pub mod store;
pub mod variant;
pub mod vcf;
