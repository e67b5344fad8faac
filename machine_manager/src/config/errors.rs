// Copyright (c) 2020 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

error_chain::error_chain! {
    errors {
        FieldIsMissing(field: &'static str, device: &'static str) {
            display("Field {} is missing for device {}", field, device)
        }
        StringLengthTooLong(field: String, max: usize) {
            display("The length of {} exceeds the max limitation {}", field, max)
        }
        IntegerOverflow(field: String) {
            display("Integer overflow occurred during parsing {}", field)
        }
        InvalidParam(field: String, device: String) {
            display("Invalid value for field {} of device {}", field, device)
        }
        UnknownDeviceType(ty: String) {
            display("Unknown device type {:?}, expected \"blk\" or \"net\"", ty)
        }
    }
}
