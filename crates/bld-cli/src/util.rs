// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::Path;

use fs_err as fs;

pub fn is_root() -> bool {
    use nix::unistd::Uid;

    Uid::effective().is_root()
}

pub fn ensure_dir_exists(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}
