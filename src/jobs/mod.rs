//! Built-in job kinds.
//!
//! | kind      | output                                   | counter unit |
//! |-----------|------------------------------------------|--------------|
//! | `none`    | sample counts                            | sample       |
//! | `printer` | one text line per sample                 | sample       |
//! | `csv`     | one file per channel                     | sample       |
//! | `npsave`  | one Arrow IPC array file per channel     | sample       |
//! | `frame`   | one `DataFrame` per channel              | y-value      |
//! | `udp`     | one JSON datagram per sample             | sample       |
//! | `devinfo` | device channel list, no stream           | -            |

pub mod csv;
pub mod devinfo;
pub mod frame;
pub mod none;
pub mod npsave;
pub mod printer;
pub mod udp;
