pub mod voucher_reader;

pub use voucher_reader::VoucherReader;
