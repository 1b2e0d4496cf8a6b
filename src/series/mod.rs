pub(crate) mod utils;

pub(crate) use utils::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
        pub mod test_utils;
    }
}
