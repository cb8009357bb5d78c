// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

#![cfg(test)]

use super::*;

#[test]
fn test_init_is_idempotent() {
    init(LevelFilter::Debug);
    init(LevelFilter::Info);
    assert_eq!(log::max_level(), LevelFilter::Info);
    info!("logger initialised");
}
