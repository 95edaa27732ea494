//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

diesel::table! {
    artifact_history (id) {
        id -> Int4,
        project_name -> Text,
        build_date -> Timestamptz,
        artifact_type -> Text,
        artifact_name -> Text,
        artifact_version -> Text,
        result_hash -> Bytea,
    }
}
